use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced at the ledger's component boundaries.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("enrichment failed: {0}")]
    Enrichment(String),

    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Persistence(err.into())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Persistence(err.into())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Category of a failure scoped to a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Scoring,
    Enrichment,
    Persistence,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Scoring => "scoring",
            FailureKind::Enrichment => "enrichment",
            FailureKind::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure of one item. It is counted against the job but never aborts the
/// chunk it belongs to, unless the job runs in strict mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Item id, or `input#<index>` for input that never produced an id.
    pub marker: String,
    pub kind: FailureKind,
    pub message: String,
}

impl ItemFailure {
    pub fn new(marker: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            kind,
            message: message.into(),
        }
    }
}

impl From<&LedgerError> for FailureKind {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::Validation(_) => FailureKind::Validation,
            LedgerError::Enrichment(_) => FailureKind::Enrichment,
            _ => FailureKind::Persistence,
        }
    }
}
