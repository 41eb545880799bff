use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub lastfm_api_key: Option<String>,

    // Component configs
    pub batch: Option<BatchConfig>,
    pub enrichment: Option<EnrichmentConfig>,
    pub statistics: Option<StatisticsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: Option<usize>,
    pub checkpoint_every: Option<usize>,
    pub scoring_workers: Option<usize>,
    /// "skip" or "strict"
    pub failure_policy: Option<String>,
    pub strict_enrichment: Option<bool>,
    pub error_log_capacity: Option<usize>,
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub min_interval_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StatisticsConfig {
    pub top_n: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
