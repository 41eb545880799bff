mod file_config;

pub use file_config::{BatchConfig, EnrichmentConfig, FileConfig, StatisticsConfig};

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub lastfm_api_key: Option<String>,
    pub chunk_size: Option<usize>,
    pub checkpoint_every: Option<usize>,
    pub scoring_workers: Option<usize>,
    pub strict: bool,
    pub strict_enrichment: bool,
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub batch: BatchSettings,
    pub enrichment: EnrichmentSettings,
    pub statistics: StatisticsSettings,
}

/// What the batch engine does when a single item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure in the job's error log and keep going.
    #[default]
    SkipOnFailure,
    /// Fail the whole job on the first item failure.
    Strict,
}

impl FailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skip" | "skip_on_failure" => Some(FailurePolicy::SkipOnFailure),
            "strict" => Some(FailurePolicy::Strict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub chunk_size: usize,
    /// Minimum number of handled items between two checkpoints.
    pub checkpoint_every: usize,
    pub scoring_workers: usize,
    pub failure_policy: FailurePolicy,
    /// Turn enrichment failures into item failures instead of falling back
    /// to empty tags.
    pub strict_enrichment: bool,
    pub error_log_capacity: usize,
    /// A `running` job whose heartbeat is older than this is treated as
    /// interrupted and may be recovered.
    pub stale_after_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            checkpoint_every: 1000,
            scoring_workers: 4,
            failure_policy: FailurePolicy::SkipOnFailure,
            strict_enrichment: false,
            error_log_capacity: 50,
            stale_after_secs: 600,
        }
    }
}

impl BatchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LedgerError::Configuration(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.scoring_workers == 0 {
            return Err(LedgerError::Configuration(
                "scoring_workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentSettings {
    /// Enrichment is disabled when no key is configured.
    pub lastfm_api_key: Option<String>,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            lastfm_api_key: None,
            min_interval_ms: 200,
            timeout_secs: 10,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsSettings {
    pub top_n: usize,
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self { top_n: 10 }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                LedgerError::Configuration(
                    "db_path must be specified via --db or in config file".to_string(),
                )
            })?;
        if db_path.is_dir() {
            return Err(LedgerError::Configuration(format!(
                "db_path is a directory: {:?}",
                db_path
            )));
        }

        let defaults = BatchSettings::default();
        let batch_file = file.batch.unwrap_or_default();
        let failure_policy = match batch_file.failure_policy.as_deref() {
            Some(s) => FailurePolicy::parse(s).ok_or_else(|| {
                LedgerError::Configuration(format!("unknown failure_policy {:?}", s))
            })?,
            None if cli.strict => FailurePolicy::Strict,
            None => defaults.failure_policy,
        };
        let batch = BatchSettings {
            chunk_size: batch_file
                .chunk_size
                .or(cli.chunk_size)
                .unwrap_or(defaults.chunk_size),
            checkpoint_every: batch_file
                .checkpoint_every
                .or(cli.checkpoint_every)
                .unwrap_or(defaults.checkpoint_every),
            scoring_workers: batch_file
                .scoring_workers
                .or(cli.scoring_workers)
                .unwrap_or(defaults.scoring_workers),
            failure_policy,
            strict_enrichment: batch_file
                .strict_enrichment
                .unwrap_or(cli.strict_enrichment),
            error_log_capacity: batch_file
                .error_log_capacity
                .unwrap_or(defaults.error_log_capacity),
            stale_after_secs: batch_file
                .stale_after_secs
                .unwrap_or(defaults.stale_after_secs),
        };
        batch.validate()?;

        let defaults = EnrichmentSettings::default();
        let enrichment_file = file.enrichment.unwrap_or_default();
        let enrichment = EnrichmentSettings {
            lastfm_api_key: file
                .lastfm_api_key
                .or_else(|| cli.lastfm_api_key.clone())
                .filter(|k| !k.trim().is_empty()),
            min_interval_ms: enrichment_file
                .min_interval_ms
                .unwrap_or(defaults.min_interval_ms),
            timeout_secs: enrichment_file.timeout_secs.unwrap_or(defaults.timeout_secs),
            max_retries: enrichment_file.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_ms: enrichment_file
                .initial_backoff_ms
                .unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: enrichment_file
                .max_backoff_ms
                .unwrap_or(defaults.max_backoff_ms),
        };
        if enrichment.timeout_secs == 0 {
            return Err(LedgerError::Configuration(
                "enrichment timeout_secs must be greater than 0".to_string(),
            ));
        }

        let statistics = StatisticsSettings {
            top_n: file
                .statistics
                .and_then(|s| s.top_n)
                .or(cli.top_n)
                .unwrap_or(StatisticsSettings::default().top_n),
        };

        Ok(AppConfig {
            db_path,
            batch,
            enrichment,
            statistics,
        })
    }
}
