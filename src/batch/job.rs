use crate::error::{FailureKind, ItemFailure, LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Score raw events into derived records.
    Ingest,
    /// Re-score stale records under the active algorithm version.
    Recompute,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ingest => "ingest",
            JobType::Recompute => "recompute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(JobType::Ingest),
            "recompute" => Some(JobType::Recompute),
            _ => None,
        }
    }
}

/// Lifecycle of a batch job.
///
/// ```text
/// pending -> running -> completed | failed | paused
/// paused  -> running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl BatchJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchJobStatus::Pending => "pending",
            BatchJobStatus::Running => "running",
            BatchJobStatus::Completed => "completed",
            BatchJobStatus::Failed => "failed",
            BatchJobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchJobStatus::Pending),
            "running" => Some(BatchJobStatus::Running),
            "completed" => Some(BatchJobStatus::Completed),
            "failed" => Some(BatchJobStatus::Failed),
            "paused" => Some(BatchJobStatus::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchJobStatus::Completed | BatchJobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: BatchJobStatus) -> bool {
        use BatchJobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
        )
    }
}

impl std::fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable marker of how far a job got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Work units handled so far, successes and failures alike.
    pub position: usize,
    /// Marker of the last handled unit: an item id, or `input#<index>`.
    pub last_marker: Option<String>,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub marker: String,
    pub kind: FailureKind,
    pub message: String,
    pub at: i64,
}

/// Bounded log of the most recent item failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLog {
    capacity: usize,
    entries: VecDeque<JobErrorEntry>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, failure: &ItemFailure, at: i64) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(JobErrorEntry {
            marker: failure.marker.clone(),
            kind: failure.kind,
            message: failure.message.clone(),
            at,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &JobErrorEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub job_type: JobType,
    pub status: BatchJobStatus,
    pub total_items: usize,
    /// Items written successfully.
    pub processed_items: usize,
    pub failed_items: usize,
    pub checkpoint: Option<Checkpoint>,
    pub error_log: ErrorLog,
    /// Algorithm version the job stamps on the records it writes.
    pub target_version: Option<String>,
    /// Set when the job ends up `failed`.
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Last sign of life from the process running the job.
    pub heartbeat_at: Option<i64>,
}

impl BatchJob {
    pub fn new(job_type: JobType, total_items: usize, error_log_capacity: usize) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type,
            status: BatchJobStatus::Pending,
            total_items,
            processed_items: 0,
            failed_items: 0,
            checkpoint: None,
            error_log: ErrorLog::new(error_log_capacity),
            target_version: None,
            failure_reason: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
        }
    }

    /// Moves the job to `next`, stamping start and finish times.
    pub fn transition(&mut self, next: BatchJobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = chrono::Utc::now().timestamp();
        if next == BatchJobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Whether a `running` job has shown no sign of life for `stale_after_secs`
    /// as of `now`. Jobs that never beat fall back to their start time.
    pub fn is_stale(&self, now: i64, stale_after_secs: u64) -> bool {
        let last_seen = self
            .heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.created_at);
        now.saturating_sub(last_seen) >= stale_after_secs as i64
    }

    pub fn position(&self) -> usize {
        self.checkpoint.as_ref().map(|c| c.position).unwrap_or(0)
    }

    pub fn record_failure(&mut self, failure: &ItemFailure) {
        self.failed_items += 1;
        self.error_log.push(failure, chrono::Utc::now().timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BatchJobStatus::Pending,
            BatchJobStatus::Running,
            BatchJobStatus::Completed,
            BatchJobStatus::Failed,
            BatchJobStatus::Paused,
        ] {
            assert_eq!(BatchJobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchJobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_allowed_transitions() {
        use BatchJobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut job = BatchJob::new(JobType::Ingest, 10, 5);
        assert!(job.started_at.is_none());
        job.transition(BatchJobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(BatchJobStatus::Completed).unwrap();
        assert!(job.finished_at.is_some());

        let err = job.transition(BatchJobStatus::Running).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_staleness_follows_latest_heartbeat() {
        let mut job = BatchJob::new(JobType::Ingest, 10, 5);
        job.created_at = 1_000;
        job.started_at = Some(1_100);
        assert!(!job.is_stale(1_500, 600));
        assert!(job.is_stale(1_700, 600));

        job.heartbeat_at = Some(1_650);
        assert!(!job.is_stale(1_700, 600));
        assert!(job.is_stale(2_250, 600));
        assert!(job.is_stale(1_650, 0));
    }

    #[test]
    fn test_error_log_keeps_most_recent() {
        let mut log = ErrorLog::new(2);
        for i in 0..5 {
            log.push(
                &ItemFailure::new(format!("m{}", i), FailureKind::Scoring, "boom"),
                i,
            );
        }
        let markers: Vec<_> = log.entries().map(|e| e.marker.as_str()).collect();
        assert_eq!(markers, vec!["m3", "m4"]);
    }

    #[test]
    fn test_record_failure_counts_beyond_capacity() {
        let mut job = BatchJob::new(JobType::Ingest, 10, 1);
        job.record_failure(&ItemFailure::new("a", FailureKind::Validation, "x"));
        job.record_failure(&ItemFailure::new("b", FailureKind::Validation, "y"));
        assert_eq!(job.failed_items, 2);
        assert_eq!(job.error_log.len(), 1);
    }
}
