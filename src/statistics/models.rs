use crate::identity::ItemId;
use serde::{Deserialize, Serialize};

/// A lightweight pointer to a record, used in top/bottom lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub item_id: ItemId,
    pub name: String,
    pub group_key: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

impl Percentiles {
    /// `sorted` must be ascending and non-empty.
    pub(crate) fn from_sorted(sorted: &[f64]) -> Self {
        Self {
            p10: percentile(sorted, 0.10),
            p25: percentile(sorted, 0.25),
            p50: percentile(sorted, 0.50),
            p75: percentile(sorted, 0.75),
            p90: percentile(sorted, 0.90),
        }
    }
}

/// Linear interpolation between the two closest ranks.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

/// Store-wide summary, persisted as the single `global_stats` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStatistics {
    pub entity_count: usize,
    pub group_count: usize,
    pub earliest_computed_at: Option<i64>,
    pub latest_computed_at: Option<i64>,
    /// `None` for an empty store.
    pub percentiles: Option<Percentiles>,
    pub mean_score: f64,
    /// Population standard deviation.
    pub std_dev_score: f64,
    pub top: Vec<ItemRef>,
    pub bottom: Vec<ItemRef>,
    pub active_version: Option<String>,
    /// Records whose algorithm version differs from `active_version`.
    pub stale_count: usize,
    pub refreshed_at: i64,
}
