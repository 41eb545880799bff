//! Profile Ledger Library
//!
//! A version-tracked store of pre-computed item profiles, with resumable
//! batch recomputation, weighted rollups and cached global statistics.

pub mod batch;
pub mod config;
pub mod enrichment;
pub mod entity_store;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod rollup;
pub mod schema;
pub mod snapshot;
pub mod sqlite_persistence;
pub mod statistics;
pub mod version_registry;

// Re-export commonly used types for convenience
pub use batch::{BatchEngine, BatchJob, BatchJobStatus, RawEvent, Scorer};
pub use entity_store::{DerivedRecord, EntityStore, SqliteEntityStore};
pub use error::{LedgerError, Result};
pub use identity::ItemId;
pub use ledger::Ledger;
pub use rollup::{GroupProfile, RollupKind, RollupStore};
pub use statistics::{GlobalStatistics, StatisticsCache};
pub use version_registry::{AlgorithmVersion, SqliteVersionRegistry, VersionRegistry};
