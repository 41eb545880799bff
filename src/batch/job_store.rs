//! Persistence of batch jobs in the `batch_jobs` table.

use super::job::{BatchJob, BatchJobStatus, Checkpoint, ErrorLog, JobType};
use crate::error::Result;
use crate::sqlite_persistence::Database;
use anyhow::Context;
use rusqlite::{params, types::Type, OptionalExtension, Row};

pub trait JobStore: Send + Sync {
    fn create(&self, job: &BatchJob) -> Result<()>;

    /// Persists status, counters, checkpoint and error log of `job`.
    fn update(&self, job: &BatchJob) -> Result<()>;

    /// Refreshes only the heartbeat. Counters and checkpoint are left as last
    /// persisted.
    fn heartbeat(&self, job_id: &str, at: i64) -> Result<()>;

    fn get(&self, job_id: &str) -> Result<Option<BatchJob>>;

    /// Most recent jobs first.
    fn list(&self, limit: usize) -> Result<Vec<BatchJob>>;

    fn find_by_status(&self, status: BatchJobStatus) -> Result<Vec<BatchJob>>;
}

const JOB_COLUMNS: &str = "job_id, job_type, status, total_items, processed_items, failed_items, \
     checkpoint_json, error_log_json, target_version, created_at, started_at, finished_at, failure_reason, heartbeat_at";

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn row_to_job(row: &Row) -> rusqlite::Result<BatchJob> {
    let job_type_str: String = row.get("job_type")?;
    let job_type = JobType::parse(&job_type_str)
        .ok_or_else(|| conversion_error(1, format!("unknown job type {}", job_type_str)))?;
    let status_str: String = row.get("status")?;
    let status = BatchJobStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(2, format!("unknown job status {}", status_str)))?;

    let checkpoint: Option<Checkpoint> = row
        .get::<_, Option<String>>("checkpoint_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| conversion_error(6, e.to_string()))?;
    let error_log_json: String = row.get("error_log_json")?;
    let error_log: ErrorLog =
        serde_json::from_str(&error_log_json).map_err(|e| conversion_error(7, e.to_string()))?;

    Ok(BatchJob {
        job_id: row.get("job_id")?,
        job_type,
        status,
        total_items: row.get::<_, i64>("total_items")? as usize,
        processed_items: row.get::<_, i64>("processed_items")? as usize,
        failed_items: row.get::<_, i64>("failed_items")? as usize,
        checkpoint,
        error_log,
        target_version: row.get("target_version")?,
        failure_reason: row.get("failure_reason")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        heartbeat_at: row.get("heartbeat_at")?,
    })
}

#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: &BatchJob) -> Result<()> {
        let checkpoint_json = job
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error_log_json = serde_json::to_string(&job.error_log)?;
        self.db.write(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO batch_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    JOB_COLUMNS
                ),
                params![
                    job.job_id,
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.total_items as i64,
                    job.processed_items as i64,
                    job.failed_items as i64,
                    checkpoint_json,
                    error_log_json,
                    job.target_version,
                    job.created_at,
                    job.started_at,
                    job.finished_at,
                    job.failure_reason,
                    job.heartbeat_at,
                ],
            )
            .with_context(|| format!("Failed to create job {}", job.job_id))?;
            Ok(())
        })?;
        Ok(())
    }

    fn update(&self, job: &BatchJob) -> Result<()> {
        let checkpoint_json = job
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error_log_json = serde_json::to_string(&job.error_log)?;
        self.db.write(|conn| {
            let updated = conn
                .execute(
                    "UPDATE batch_jobs SET status = ?2, total_items = ?3, processed_items = ?4,
                        failed_items = ?5, checkpoint_json = ?6, error_log_json = ?7,
                        target_version = ?8, started_at = ?9, finished_at = ?10, failure_reason = ?11,
                        heartbeat_at = ?12
                     WHERE job_id = ?1",
                    params![
                        job.job_id,
                        job.status.as_str(),
                        job.total_items as i64,
                        job.processed_items as i64,
                        job.failed_items as i64,
                        checkpoint_json,
                        error_log_json,
                        job.target_version,
                        job.started_at,
                        job.finished_at,
                        job.failure_reason,
                        job.heartbeat_at,
                    ],
                )
                .with_context(|| format!("Failed to update job {}", job.job_id))?;
            if updated == 0 {
                anyhow::bail!("Job {} does not exist", job.job_id);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn heartbeat(&self, job_id: &str, at: i64) -> Result<()> {
        self.db.write(|conn| {
            let updated = conn
                .prepare_cached("UPDATE batch_jobs SET heartbeat_at = ?2 WHERE job_id = ?1")?
                .execute(params![job_id, at])
                .with_context(|| format!("Failed to record heartbeat of job {}", job_id))?;
            if updated == 0 {
                anyhow::bail!("Job {} does not exist", job_id);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<BatchJob>> {
        let job = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM batch_jobs WHERE job_id = ?1", JOB_COLUMNS),
                    params![job_id],
                    row_to_job,
                )
                .optional()?)
        })?;
        Ok(job)
    }

    fn list(&self, limit: usize) -> Result<Vec<BatchJob>> {
        let jobs = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM batch_jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map(params![limit as i64], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })?;
        Ok(jobs)
    }

    fn find_by_status(&self, status: BatchJobStatus) -> Result<Vec<BatchJob>> {
        let jobs = self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM batch_jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map(params![status.as_str()], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, ItemFailure};
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteJobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("ledger.db")).unwrap();
        (SqliteJobStore::new(db), temp_dir)
    }

    #[test]
    fn test_create_and_get() {
        let (store, _tmp) = create_test_store();
        let job = BatchJob::new(JobType::Ingest, 42, 10);
        store.create(&job).unwrap();

        let loaded = store.get(&job.job_id).unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_update_persists_progress() {
        let (store, _tmp) = create_test_store();
        let mut job = BatchJob::new(JobType::Recompute, 10, 10);
        store.create(&job).unwrap();

        job.transition(BatchJobStatus::Running).unwrap();
        job.processed_items = 7;
        job.record_failure(&ItemFailure::new("input#3", FailureKind::Validation, "blank name"));
        job.checkpoint = Some(Checkpoint {
            position: 8,
            last_marker: Some("abc".to_string()),
            recorded_at: 123,
        });
        job.target_version = Some("v2".to_string());
        store.update(&job).unwrap();

        let loaded = store.get(&job.job_id).unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.error_log.len(), 1);
        assert_eq!(loaded.position(), 8);
    }

    #[test]
    fn test_heartbeat_leaves_progress_untouched() {
        let (store, _tmp) = create_test_store();
        let mut job = BatchJob::new(JobType::Ingest, 10, 10);
        job.transition(BatchJobStatus::Running).unwrap();
        job.processed_items = 3;
        store.create(&job).unwrap();

        store.heartbeat(&job.job_id, 4_242).unwrap();

        let loaded = store.get(&job.job_id).unwrap().unwrap();
        assert_eq!(loaded.heartbeat_at, Some(4_242));
        assert_eq!(loaded.processed_items, 3);
        assert!(store.heartbeat("missing", 1).is_err());
    }

    #[test]
    fn test_update_missing_job_fails() {
        let (store, _tmp) = create_test_store();
        let job = BatchJob::new(JobType::Ingest, 1, 1);
        assert!(store.update(&job).is_err());
    }

    #[test]
    fn test_find_by_status_and_list() {
        let (store, _tmp) = create_test_store();
        let mut running = BatchJob::new(JobType::Ingest, 1, 1);
        running.transition(BatchJobStatus::Running).unwrap();
        store.create(&running).unwrap();
        store.create(&BatchJob::new(JobType::Ingest, 1, 1)).unwrap();

        let found = store.find_by_status(BatchJobStatus::Running).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, running.job_id);
        assert_eq!(store.list(10).unwrap().len(), 2);
        assert_eq!(store.list(1).unwrap().len(), 1);
    }
}
