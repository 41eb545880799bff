//! Resumable batch jobs that score raw events into derived records.

mod dedup;
mod engine;
mod job;
mod job_store;
mod progress;
mod scoring;

pub use crate::config::{BatchSettings, FailurePolicy};
pub use dedup::{deduplicate, EventInput, PendingItem, RawEvent, WorkUnit};
pub use engine::{BatchEngine, JobRun, StopHandle};
pub use job::{BatchJob, BatchJobStatus, Checkpoint, ErrorLog, JobErrorEntry, JobType};
pub use job_store::{JobStore, SqliteJobStore};
pub use progress::{
    ProgressHub, ProgressObserver, ProgressSnapshot, ProgressTracker, THROUGHPUT_ALPHA,
};
pub use scoring::{PlayCountScorer, Scorer, ScoringError, ScoringInput, ScoringPool};
