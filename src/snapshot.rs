//! Whole-ledger export and import as a single JSON document.

use crate::entity_store::{DerivedRecord, EntityStore};
use crate::error::{LedgerError, Result};
use crate::rollup::{GroupProfile, RollupStore};
use crate::statistics::{GlobalStatistics, StatisticsCache};
use crate::version_registry::{AlgorithmVersion, VersionRegistry};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{info, warn};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const IMPORT_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub exported_at: i64,
    pub active_version: Option<String>,
    pub algorithm_versions: Vec<AlgorithmVersion>,
    pub records: Vec<DerivedRecord>,
    pub profiles: Vec<GroupProfile>,
    pub statistics: Option<GlobalStatistics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub versions: usize,
    pub records_written: usize,
    pub records_rejected: usize,
    pub profiles: usize,
    pub statistics: bool,
}

pub struct SnapshotManager {
    entities: Arc<dyn EntityStore>,
    registry: Arc<dyn VersionRegistry>,
    rollups: Arc<RollupStore>,
    statistics: Arc<StatisticsCache>,
}

impl SnapshotManager {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        registry: Arc<dyn VersionRegistry>,
        rollups: Arc<RollupStore>,
        statistics: Arc<StatisticsCache>,
    ) -> Self {
        Self {
            entities,
            registry,
            rollups,
            statistics,
        }
    }

    /// Collects the current state of every store.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut records = Vec::new();
        self.entities.for_each_record(&mut |record| {
            records.push(record);
            Ok(())
        })?;

        Ok(Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: chrono::Utc::now().timestamp(),
            active_version: self
                .registry
                .current_active()?
                .filter(|v| v.is_active)
                .map(|v| v.version_id),
            algorithm_versions: self.registry.list()?,
            records,
            profiles: self.rollups.all_profiles()?,
            statistics: self.statistics.read()?,
        })
    }

    pub fn export_snapshot<W: Write>(&self, writer: W) -> Result<Snapshot> {
        let snapshot = self.snapshot()?;
        serde_json::to_writer_pretty(writer, &snapshot).context("Failed to write snapshot")?;
        info!(
            "Exported {} versions, {} records, {} profiles",
            snapshot.algorithm_versions.len(),
            snapshot.records.len(),
            snapshot.profiles.len()
        );
        Ok(snapshot)
    }

    pub fn import_snapshot<R: Read>(&self, reader: R) -> Result<ImportSummary> {
        let snapshot: Snapshot = serde_json::from_reader(reader).map_err(|e| {
            LedgerError::Validation(format!("snapshot is not valid JSON: {}", e))
        })?;
        self.import(snapshot)
    }

    /// Writes `snapshot` into the stores. Versions are registered before any
    /// record so that every record's version exists.
    pub fn import(&self, snapshot: Snapshot) -> Result<ImportSummary> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(LedgerError::Validation(format!(
                "unsupported snapshot format version {} (expected {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if let Some(active) = &snapshot.active_version {
            let flagged = snapshot
                .algorithm_versions
                .iter()
                .any(|v| &v.version_id == active && v.is_active);
            if !flagged {
                return Err(LedgerError::Consistency(format!(
                    "snapshot names {} as active but does not flag it",
                    active
                )));
            }
        }

        self.registry.register_all(&snapshot.algorithm_versions)?;

        let mut summary = ImportSummary {
            versions: snapshot.algorithm_versions.len(),
            ..ImportSummary::default()
        };
        for chunk in snapshot.records.chunks(IMPORT_CHUNK_SIZE) {
            let outcome = self.entities.upsert_batch(chunk)?;
            summary.records_written += outcome.succeeded;
            summary.records_rejected += outcome.failed.len();
            for failure in &outcome.failed {
                warn!(
                    "Snapshot record {} rejected ({}): {}",
                    failure.marker, failure.kind, failure.message
                );
            }
        }

        self.rollups.replace_all(&snapshot.profiles)?;
        summary.profiles = snapshot.profiles.len();

        if let Some(stats) = &snapshot.statistics {
            self.statistics.store(stats)?;
            summary.statistics = true;
        }

        info!(
            "Imported {} versions, {} records ({} rejected), {} profiles",
            summary.versions, summary.records_written, summary.records_rejected, summary.profiles
        );
        Ok(summary)
    }
}
