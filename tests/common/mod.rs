//! Common test infrastructure
//!
//! Builds a ledger on a temporary database with one active algorithm
//! version, plus deterministic scorers and event generators.

#![allow(dead_code)]

use profile_ledger::batch::{
    BatchEngine, BatchSettings, ProgressHub, RawEvent, Scorer, ScoringError, ScoringInput,
};
use profile_ledger::config::StatisticsSettings;
use profile_ledger::entity_store::ComputedOutput;
use profile_ledger::{AlgorithmVersion, Ledger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub const ACTIVE_VERSION: &str = "v1";
pub const GROUP_COUNT: usize = 10;
/// 2024-01-01T00:00:00Z
pub const BASE_TIMESTAMP: i64 = 1_704_067_200;

pub struct TestLedger {
    pub ledger: Ledger,
    _temp_dir: TempDir,
}

impl TestLedger {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(
            temp_dir.path().join("ledger.db"),
            StatisticsSettings::default(),
        )
        .unwrap();
        ledger
            .registry
            .register(&AlgorithmVersion::new(ACTIVE_VERSION, "initial", 1, true))
            .unwrap();
        Self {
            ledger,
            _temp_dir: temp_dir,
        }
    }

    pub fn engine(&self, scorer: Arc<dyn Scorer>, settings: BatchSettings) -> BatchEngine {
        self.ledger
            .batch_engine(scorer, None, settings, Arc::new(ProgressHub::new()))
            .unwrap()
    }

    pub fn activate(&self, version_id: &str, created_at: i64) {
        self.ledger
            .registry
            .register(&AlgorithmVersion::new(version_id, version_id, created_at, true))
            .unwrap();
    }
}

pub fn batch_settings(chunk_size: usize) -> BatchSettings {
    BatchSettings {
        chunk_size,
        checkpoint_every: chunk_size,
        scoring_workers: 2,
        ..BatchSettings::default()
    }
}

/// One event per item: `Track i` by `Artist (i % GROUP_COUNT)`.
pub fn distinct_events(n: usize) -> Vec<RawEvent> {
    (0..n)
        .map(|i| {
            RawEvent::new(
                &format!("Track {}", i),
                &format!("Artist {}", i % GROUP_COUNT),
                "Album",
                BASE_TIMESTAMP + i as i64,
            )
        })
        .collect()
}

/// Returns the same output for every item.
pub struct ConstantScorer(pub f64);

impl Scorer for ConstantScorer {
    fn algorithm_hint(&self) -> &str {
        "constant"
    }

    fn score(&self, _input: &ScoringInput) -> Result<ComputedOutput, ScoringError> {
        let mut fields = BTreeMap::new();
        fields.insert("energy".to_string(), self.0 / 100.0);
        Ok(ComputedOutput {
            score: self.0,
            confidence: 0.9,
            fields,
        })
    }
}

/// Scores by play count, failing the items whose normalized name is listed.
pub struct SelectiveScorer {
    pub failing_names: Vec<String>,
}

impl Scorer for SelectiveScorer {
    fn algorithm_hint(&self) -> &str {
        "selective"
    }

    fn score(&self, input: &ScoringInput) -> Result<ComputedOutput, ScoringError> {
        if self.failing_names.contains(&input.key.name) {
            return Err(ScoringError::Computation(format!(
                "refusing {}",
                input.key.name
            )));
        }
        Ok(ComputedOutput {
            score: input.play_count as f64 * 10.0,
            confidence: 0.5,
            fields: BTreeMap::new(),
        })
    }
}
