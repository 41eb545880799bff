//! The scoring seam and the pool that runs it.

use super::dedup::WorkUnit;
use crate::entity_store::ComputedOutput;
use crate::error::{LedgerError, Result};
use crate::identity::{ItemId, NaturalKey};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("invalid scoring input: {0}")]
    InvalidInput(String),
    #[error("scoring failed: {0}")]
    Computation(String),
}

/// Everything a scorer may look at for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringInput {
    pub item_id: ItemId,
    pub key: NaturalKey,
    pub play_count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub tags: Vec<String>,
    pub features: Option<Value>,
}

impl ScoringInput {
    /// Builds the input for `unit`, with enrichment already merged into its
    /// tags and features.
    pub fn from_unit(unit: &WorkUnit) -> Self {
        Self {
            item_id: unit.item_id.clone(),
            key: unit.key.clone(),
            play_count: unit.play_count(),
            first_seen: unit.first_seen(),
            last_seen: unit.last_seen(),
            tags: unit.tags.clone(),
            features: unit.features.clone(),
        }
    }
}

/// A pure function from an item's history to its computed output.
///
/// Must be deterministic: recomputing an unchanged item under the same
/// algorithm has to produce the same output.
pub trait Scorer: Send + Sync {
    /// Label of the algorithm this scorer implements, for logs.
    fn algorithm_hint(&self) -> &str;

    fn score(&self, input: &ScoringInput) -> std::result::Result<ComputedOutput, ScoringError>;
}

/// Frequency and engagement-span scorer used by the command line tool.
pub struct PlayCountScorer;

const SECONDS_PER_DAY: f64 = 86_400.0;

impl Scorer for PlayCountScorer {
    fn algorithm_hint(&self) -> &str {
        "play-count"
    }

    fn score(&self, input: &ScoringInput) -> std::result::Result<ComputedOutput, ScoringError> {
        if input.play_count == 0 {
            return Err(ScoringError::InvalidInput(format!(
                "{} has no plays",
                input.item_id
            )));
        }
        if input.last_seen < input.first_seen {
            return Err(ScoringError::InvalidInput(format!(
                "{} has last_seen before first_seen",
                input.item_id
            )));
        }

        let plays = input.play_count as f64;
        let frequency = (1.0 + plays).ln();
        let span_days = (input.last_seen - input.first_seen) as f64 / SECONDS_PER_DAY;
        // Sustained listening counts for more than a burst
        let persistence = (1.0 + span_days).ln();
        let score = 100.0 * (1.0 - (-(frequency + 0.5 * persistence) / 4.0).exp());

        let mut fields = BTreeMap::new();
        fields.insert("frequency".to_string(), frequency);
        fields.insert("span_days".to_string(), span_days);
        fields.insert("tag_count".to_string(), input.tags.len() as f64);
        if let Some(listeners) = input
            .features
            .as_ref()
            .and_then(|f| f.get("listeners"))
            .and_then(Value::as_f64)
        {
            fields.insert("listeners_log".to_string(), (1.0 + listeners).ln());
        }

        Ok(ComputedOutput {
            score,
            confidence: plays / (plays + 5.0),
            fields,
        })
    }
}

/// Dedicated rayon pool for scoring, so a big job never starves the global
/// pool.
pub struct ScoringPool {
    pool: rayon::ThreadPool,
}

impl ScoringPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("scorer-{}", i))
            .build()
            .map_err(|e| LedgerError::Configuration(format!("cannot build scoring pool: {}", e)))?;
        Ok(Self { pool })
    }

    /// Scores every input, keeping input order. Outputs with non-finite
    /// numbers are turned into errors.
    pub fn score_all(
        &self,
        scorer: &dyn Scorer,
        inputs: &[ScoringInput],
    ) -> Vec<std::result::Result<ComputedOutput, ScoringError>> {
        self.pool.install(|| {
            inputs
                .par_iter()
                .map(|input| scorer.score(input).and_then(check_finite))
                .collect()
        })
    }
}

fn check_finite(output: ComputedOutput) -> std::result::Result<ComputedOutput, ScoringError> {
    if !output.score.is_finite() {
        return Err(ScoringError::Computation(format!(
            "score is not finite: {}",
            output.score
        )));
    }
    if let Some((field, value)) = output.fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(ScoringError::Computation(format!(
            "field {} is not finite: {}",
            field, value
        )));
    }
    Ok(output)
}
