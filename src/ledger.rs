//! Wiring of every store over one database.

use crate::batch::{BatchEngine, BatchSettings, JobStore, ProgressHub, Scorer, SqliteJobStore};
use crate::config::StatisticsSettings;
use crate::enrichment::EnrichmentProvider;
use crate::entity_store::{EntityStore, SqliteEntityStore};
use crate::error::Result;
use crate::rollup::RollupStore;
use crate::snapshot::SnapshotManager;
use crate::sqlite_persistence::Database;
use crate::statistics::StatisticsCache;
use crate::version_registry::{SqliteVersionRegistry, VersionRegistry};
use std::path::Path;
use std::sync::Arc;

pub struct Ledger {
    db: Database,
    pub entities: Arc<dyn EntityStore>,
    pub registry: Arc<dyn VersionRegistry>,
    pub jobs: Arc<dyn JobStore>,
    pub rollups: Arc<RollupStore>,
    pub statistics: Arc<StatisticsCache>,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(path: P, statistics: StatisticsSettings) -> Result<Self> {
        let db = Database::open(path)?;
        let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(db.clone()));
        let registry: Arc<dyn VersionRegistry> = Arc::new(SqliteVersionRegistry::new(db.clone()));
        let jobs: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let rollups = Arc::new(RollupStore::new(db.clone(), entities.clone()));
        let statistics = Arc::new(StatisticsCache::new(
            db.clone(),
            entities.clone(),
            registry.clone(),
            statistics,
        ));
        Ok(Self {
            db,
            entities,
            registry,
            jobs,
            rollups,
            statistics,
        })
    }

    pub fn batch_engine(
        &self,
        scorer: Arc<dyn Scorer>,
        enrichment: Option<Arc<dyn EnrichmentProvider>>,
        settings: BatchSettings,
        progress: Arc<ProgressHub>,
    ) -> Result<BatchEngine> {
        BatchEngine::new(
            self.entities.clone(),
            self.registry.clone(),
            self.jobs.clone(),
            scorer,
            enrichment,
            settings,
            progress,
        )
    }

    pub fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(
            self.entities.clone(),
            self.registry.clone(),
            self.rollups.clone(),
            self.statistics.clone(),
        )
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Closes both connections. Stores still held elsewhere fail afterwards.
    pub fn close(self) -> Result<()> {
        self.db.close()?;
        Ok(())
    }
}
