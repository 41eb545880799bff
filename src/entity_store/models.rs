//! Data models for the entity store.

use crate::error::{FailureKind, ItemFailure, LedgerError, Result};
use crate::identity::ItemId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current layout of the raw payload written by the batch engine.
pub const RAW_SCHEMA_VERSION: u32 = 1;
/// Current layout of [`ComputedOutput`].
pub const COMPUTED_SCHEMA_VERSION: u32 = 1;

/// An opaque JSON payload tagged with the layout version it was written with.
///
/// The store never interprets `data`; consumers decode it lazily with
/// [`VersionedBlob::decode`] once they know which layout to expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedBlob {
    pub schema_version: u32,
    pub data: Value,
}

impl VersionedBlob {
    pub fn encode<T: Serialize>(schema_version: u32, value: &T) -> Result<Self> {
        Ok(Self {
            schema_version,
            data: serde_json::to_value(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            LedgerError::Validation(format!(
                "payload (schema v{}) does not decode: {}",
                self.schema_version, e
            ))
        })
    }
}

/// What a scorer produces for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedOutput {
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub fields: BTreeMap<String, f64>,
}

/// The stored result of scoring one item under one algorithm version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub item_id: ItemId,
    pub name: String,
    /// Normalized grouping key (the artist, for tracks).
    pub group_key: String,
    pub context: String,
    pub raw: VersionedBlob,
    pub computed: VersionedBlob,
    pub confidence: f64,
    pub algorithm_version: String,
    pub computed_at: i64,
    /// Set by the store on every write.
    pub updated_at: i64,
    pub is_valid: bool,
    pub score: f64,
    pub play_count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub tags: Vec<String>,
}

impl DerivedRecord {
    pub fn computed_output(&self) -> Result<ComputedOutput> {
        self.computed.decode()
    }

    /// Checks the record before it is written.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !ItemId::is_well_formed(self.item_id.as_str()) {
            return Err(format!("malformed item id {:?}", self.item_id.as_str()));
        }
        if self.name.trim().is_empty() {
            return Err("name is empty".to_string());
        }
        if self.group_key.trim().is_empty() {
            return Err("group key is empty".to_string());
        }
        if self.algorithm_version.is_empty() {
            return Err("algorithm version is empty".to_string());
        }
        if !self.score.is_finite() {
            return Err(format!("score is not finite: {}", self.score));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence out of [0,1]: {}", self.confidence));
        }
        if self.first_seen > self.last_seen {
            return Err(format!(
                "first_seen {} is after last_seen {}",
                self.first_seen, self.last_seen
            ));
        }
        if let Ok(output) = self.computed.decode::<ComputedOutput>() {
            if let Some((field, value)) = output.fields.iter().find(|(_, v)| !v.is_finite()) {
                return Err(format!("field {} is not finite: {}", field, value));
            }
        }
        Ok(())
    }

    /// Computed fields as stored in the field index.
    pub fn fields(&self) -> BTreeMap<String, f64> {
        self.computed
            .decode::<ComputedOutput>()
            .map(|o| o.fields)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// Result of a batch upsert: how many records were written and which were
/// rolled back individually.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertOutcome {
    pub succeeded: usize,
    pub failed: Vec<ItemFailure>,
}

impl UpsertOutcome {
    pub fn record_failure(&mut self, marker: &str, kind: FailureKind, message: String) {
        self.failed.push(ItemFailure::new(marker, kind, message));
    }
}
