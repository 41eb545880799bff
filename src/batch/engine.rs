//! Runs ingest and recompute jobs: chunking, enrichment, scoring,
//! persistence, checkpointing and cooperative stop.

use super::dedup::{deduplicate, EventInput, PendingItem, WorkUnit};
use super::job::{BatchJob, BatchJobStatus, Checkpoint, JobErrorEntry, JobType};
use super::job_store::JobStore;
use super::progress::{ProgressHub, ProgressTracker};
use super::scoring::{Scorer, ScoringInput, ScoringPool};
use crate::config::{BatchSettings, FailurePolicy};
use crate::enrichment::{EnrichmentProvider, TagCache};
use crate::entity_store::{
    ComputedOutput, DerivedRecord, EntityStore, VersionedBlob, COMPUTED_SCHEMA_VERSION,
    RAW_SCHEMA_VERSION,
};
use crate::error::{FailureKind, ItemFailure, LedgerError, Result};
use crate::identity::ItemId;
use crate::version_registry::VersionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Slot = std::result::Result<WorkUnit, ItemFailure>;

/// Requests a cooperative stop of one job. The job pauses at the next chunk
/// boundary.
#[derive(Debug, Clone)]
pub struct StopHandle {
    job_id: String,
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        info!("Stop requested for job {}", self.job_id);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug)]
enum Work {
    Ingest(Vec<PendingItem>),
    Recompute,
}

/// A created job, ready to be handed to [`BatchEngine::run`].
#[derive(Debug)]
pub struct JobRun {
    job: BatchJob,
    work: Work,
    token: CancellationToken,
}

impl JobRun {
    pub fn job(&self) -> &BatchJob {
        &self.job
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            job_id: self.job.job_id.clone(),
            token: self.token.clone(),
        }
    }
}

/// Mutable state of one job run.
struct RunState {
    target: String,
    tracker: ProgressTracker,
    cache: TagCache,
    position: usize,
    last_marker: Option<String>,
    since_checkpoint: usize,
}

enum ChunkVerdict {
    Continue,
    /// Strict mode hit an item failure; the job must fail.
    Rejected(String),
}

pub struct BatchEngine {
    entities: Arc<dyn EntityStore>,
    registry: Arc<dyn VersionRegistry>,
    jobs: Arc<dyn JobStore>,
    scorer: Arc<dyn Scorer>,
    enrichment: Option<Arc<dyn EnrichmentProvider>>,
    settings: BatchSettings,
    pool: ScoringPool,
    progress: Arc<ProgressHub>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl BatchEngine {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        registry: Arc<dyn VersionRegistry>,
        jobs: Arc<dyn JobStore>,
        scorer: Arc<dyn Scorer>,
        enrichment: Option<Arc<dyn EnrichmentProvider>>,
        settings: BatchSettings,
        progress: Arc<ProgressHub>,
    ) -> Result<Self> {
        settings.validate()?;
        let pool = ScoringPool::new(settings.scoring_workers)?;
        Ok(Self {
            entities,
            registry,
            jobs,
            scorer,
            enrichment,
            settings,
            pool,
            progress,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    // =========================================================================
    // Job creation
    // =========================================================================

    /// Deduplicates `events` and creates a pending ingest job for them.
    pub fn prepare_ingest<I>(&self, events: I) -> Result<JobRun>
    where
        I: IntoIterator,
        I::Item: Into<EventInput>,
    {
        self.ensure_idle()?;
        let items = deduplicate(events);
        let mut job = BatchJob::new(JobType::Ingest, items.len(), self.settings.error_log_capacity);
        job.target_version = self.active_version_id()?;
        self.jobs.create(&job)?;
        info!(
            "Created ingest job {} with {} items",
            job.job_id, job.total_items
        );
        Ok(JobRun {
            job,
            work: Work::Ingest(items),
            token: CancellationToken::new(),
        })
    }

    /// Reloads a paused ingest job. `events` must be the same input the job
    /// was started with.
    pub fn prepare_resume_ingest<I>(&self, job_id: &str, events: I) -> Result<JobRun>
    where
        I: IntoIterator,
        I::Item: Into<EventInput>,
    {
        self.ensure_idle()?;
        let job = self.load_resumable(job_id, JobType::Ingest)?;
        let items = deduplicate(events);

        if items.len() != job.total_items {
            return Err(LedgerError::Configuration(format!(
                "job {} was started with {} items, got {}",
                job_id,
                job.total_items,
                items.len()
            )));
        }
        let position = job.position();
        if position > 0 {
            let expected = job.checkpoint.as_ref().and_then(|c| c.last_marker.as_deref());
            let found = items.get(position - 1).map(PendingItem::marker);
            if found.as_deref() != expected {
                return Err(LedgerError::Configuration(format!(
                    "input does not match the checkpoint of job {} at position {}",
                    job_id, position
                )));
            }
        }

        info!("Resuming ingest job {} at {}/{}", job_id, position, job.total_items);
        Ok(JobRun {
            job,
            work: Work::Ingest(items),
            token: CancellationToken::new(),
        })
    }

    /// Creates a job re-scoring every record not computed with the active
    /// algorithm version.
    pub fn prepare_recompute(&self) -> Result<JobRun> {
        self.ensure_idle()?;
        let mut job = BatchJob::new(JobType::Recompute, 0, self.settings.error_log_capacity);
        job.target_version = self.active_version_id()?;
        if let Some(target) = &job.target_version {
            job.total_items = self.registry.count_stale(target)?;
        }
        self.jobs.create(&job)?;
        info!(
            "Created recompute job {} for {} stale records (target {:?})",
            job.job_id, job.total_items, job.target_version
        );
        Ok(JobRun {
            job,
            work: Work::Recompute,
            token: CancellationToken::new(),
        })
    }

    pub fn prepare_resume_recompute(&self, job_id: &str) -> Result<JobRun> {
        self.ensure_idle()?;
        let job = self.load_resumable(job_id, JobType::Recompute)?;
        info!(
            "Resuming recompute job {} at {}/{}",
            job_id,
            job.position(),
            job.total_items
        );
        Ok(JobRun {
            job,
            work: Work::Recompute,
            token: CancellationToken::new(),
        })
    }

    // =========================================================================
    // Convenience entry points
    // =========================================================================

    pub fn start_ingest<I>(&self, events: I) -> Result<BatchJob>
    where
        I: IntoIterator,
        I::Item: Into<EventInput>,
    {
        let run = self.prepare_ingest(events)?;
        self.run(run)
    }

    pub fn resume_ingest<I>(&self, job_id: &str, events: I) -> Result<BatchJob>
    where
        I: IntoIterator,
        I::Item: Into<EventInput>,
    {
        let run = self.prepare_resume_ingest(job_id, events)?;
        self.run(run)
    }

    pub fn start_recompute(&self) -> Result<BatchJob> {
        let run = self.prepare_recompute()?;
        self.run(run)
    }

    pub fn resume_recompute(&self, job_id: &str) -> Result<BatchJob> {
        let run = self.prepare_resume_recompute(job_id)?;
        self.run(run)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs a prepared job on the calling thread until it completes, fails
    /// or is stopped.
    pub fn run(&self, run: JobRun) -> Result<BatchJob> {
        let JobRun {
            mut job,
            work,
            token,
        } = run;
        self.lock_running()
            .insert(job.job_id.clone(), token.clone());

        let result = match work {
            Work::Ingest(items) => self.run_ingest(&mut job, &items, &token),
            Work::Recompute => self.run_recompute(&mut job, &token),
        };

        self.lock_running().remove(&job.job_id);
        result.map(|_| job)
    }

    fn run_ingest(
        &self,
        job: &mut BatchJob,
        items: &[PendingItem],
        token: &CancellationToken,
    ) -> Result<()> {
        let mut state = self.begin(job)?;
        let start = state.position.min(items.len());

        for chunk in items[start..].chunks(self.settings.chunk_size) {
            if token.is_cancelled() {
                return self.finish(job, &mut state, BatchJobStatus::Paused);
            }

            let slots: Vec<Slot> = chunk
                .iter()
                .map(|item| match item {
                    PendingItem::Unit(unit) => Ok(unit.clone()),
                    PendingItem::Invalid { marker, reason } => Err(ItemFailure::new(
                        marker.as_str(),
                        FailureKind::Validation,
                        reason.as_str(),
                    )),
                })
                .collect();

            let verdict = self.process_chunk(job, &mut state, slots, true)?;
            state.last_marker = chunk.last().map(PendingItem::marker);
            if let ChunkVerdict::Rejected(reason) = verdict {
                self.fail_job(job, &state, reason);
                return Ok(());
            }
            self.after_chunk(job, &mut state)?;
        }

        self.finish(job, &mut state, BatchJobStatus::Completed)
    }

    fn run_recompute(&self, job: &mut BatchJob, token: &CancellationToken) -> Result<()> {
        let mut state = self.begin(job)?;
        let mut cursor = state
            .last_marker
            .as_deref()
            .and_then(|marker| ItemId::parse(marker).ok());

        loop {
            if token.is_cancelled() {
                return self.finish(job, &mut state, BatchJobStatus::Paused);
            }

            let page = match self.registry.find_stale_after(
                &state.target,
                cursor.as_ref(),
                self.settings.chunk_size,
            ) {
                Ok(page) => page,
                Err(e) => {
                    self.fail_job(job, &state, format!("reading stale records failed: {}", e));
                    return Err(e);
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.item_id.clone());

            let slots: Vec<Slot> = page.into_iter().map(unit_from_record).collect();
            let verdict = self.process_chunk(job, &mut state, slots, false)?;
            state.last_marker = cursor.as_ref().map(ItemId::to_string);
            if let ChunkVerdict::Rejected(reason) = verdict {
                self.fail_job(job, &state, reason);
                return Ok(());
            }
            self.after_chunk(job, &mut state)?;
        }

        self.finish(job, &mut state, BatchJobStatus::Completed)
    }

    /// Moves the job to running and resolves the version it stamps.
    fn begin(&self, job: &mut BatchJob) -> Result<RunState> {
        job.transition(BatchJobStatus::Running)?;
        job.failure_reason = None;
        job.heartbeat_at = Some(chrono::Utc::now().timestamp());
        self.jobs.update(job)?;

        let position = job.position();
        let mut state = RunState {
            target: String::new(),
            tracker: ProgressTracker::new(job.total_items, position),
            cache: TagCache::new(),
            position,
            last_marker: job.checkpoint.as_ref().and_then(|c| c.last_marker.clone()),
            since_checkpoint: 0,
        };

        let target = match &job.target_version {
            Some(target) => target.clone(),
            None => {
                let reason = "no algorithm version is registered".to_string();
                self.fail_job(job, &state, reason.clone());
                return Err(LedgerError::Configuration(reason));
            }
        };
        info!(
            "Job {} ({}) running against version {} using {}",
            job.job_id,
            job.job_type.as_str(),
            target,
            self.scorer.algorithm_hint()
        );
        state.target = target;
        self.publish(job, &state);
        Ok(state)
    }

    /// Enriches, scores and persists one chunk, then updates the job's
    /// counters. Returns `Err` only when the chunk could not be persisted.
    fn process_chunk(
        &self,
        job: &mut BatchJob,
        state: &mut RunState,
        mut slots: Vec<Slot>,
        enrich: bool,
    ) -> Result<ChunkVerdict> {
        let handled = slots.len();
        if enrich {
            self.enrich(&mut slots, &mut state.cache);
        }

        let mut failures = Vec::new();
        let mut units = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Ok(unit) => units.push(unit),
                Err(failure) => failures.push(failure),
            }
        }

        let inputs: Vec<ScoringInput> = units.iter().map(ScoringInput::from_unit).collect();
        let outputs = self.pool.score_all(self.scorer.as_ref(), &inputs);
        let now = chrono::Utc::now().timestamp();

        let mut records = Vec::with_capacity(units.len());
        for (unit, output) in units.into_iter().zip(outputs) {
            let built = output
                .map_err(|e| ItemFailure::new(unit.item_id.as_str(), FailureKind::Scoring, e.to_string()))
                .and_then(|output| build_record(unit, output, &state.target, now));
            match built {
                Ok(record) => records.push(record),
                Err(failure) => failures.push(failure),
            }
        }

        if self.settings.failure_policy == FailurePolicy::Strict {
            if let Some(first) = failures.first() {
                job.record_failure(first);
                return Ok(ChunkVerdict::Rejected(format!(
                    "{} failed ({}): {}",
                    first.marker, first.kind, first.message
                )));
            }
        }

        if !records.is_empty() {
            let persisted = match self.settings.failure_policy {
                FailurePolicy::Strict => self.entities.upsert_batch_atomic(&records),
                FailurePolicy::SkipOnFailure => self.entities.upsert_batch(&records),
            };
            match persisted {
                Ok(outcome) => {
                    job.processed_items += outcome.succeeded;
                    failures.extend(outcome.failed);
                }
                Err(e) => {
                    error!("Job {} failed to persist a chunk: {}", job.job_id, e);
                    self.fail_job(job, state, format!("chunk persistence failed: {}", e));
                    return Err(e);
                }
            }
        }

        state.position += handled;
        state.since_checkpoint += handled;

        for failure in &failures {
            debug!(
                "Job {}: item {} failed ({}): {}",
                job.job_id, failure.marker, failure.kind, failure.message
            );
            job.record_failure(failure);
        }
        if self.settings.failure_policy == FailurePolicy::Strict {
            if let Some(first) = failures.first() {
                return Ok(ChunkVerdict::Rejected(format!(
                    "{} failed ({}): {}",
                    first.marker, first.kind, first.message
                )));
            }
        }

        info!(
            "Job {}: {}/{} handled, {} written, {} failed in chunk",
            job.job_id,
            state.position,
            job.total_items,
            handled - failures.len(),
            failures.len()
        );
        Ok(ChunkVerdict::Continue)
    }

    /// Fills tags and features from the provider for units that carried no
    /// tags of their own.
    fn enrich(&self, slots: &mut [Slot], cache: &mut TagCache) {
        let Some(provider) = &self.enrichment else {
            return;
        };
        for slot in slots.iter_mut() {
            let Ok(unit) = slot.as_mut() else {
                continue;
            };
            if unit.tags_supplied {
                continue;
            }
            match cache.get_or_fetch(provider.as_ref(), &unit.key.group) {
                Ok(enrichment) => {
                    unit.tags = enrichment.tags;
                    if unit.features.is_none() {
                        unit.features = enrichment.features;
                    }
                }
                Err(message) if self.settings.strict_enrichment => {
                    let failure =
                        ItemFailure::new(unit.item_id.as_str(), FailureKind::Enrichment, message);
                    *slot = Err(failure);
                }
                // Soft failure: already logged by the cache
                Err(_) => {}
            }
        }
    }

    fn after_chunk(&self, job: &mut BatchJob, state: &mut RunState) -> Result<()> {
        if state.since_checkpoint >= self.settings.checkpoint_every {
            self.write_checkpoint(job, state)?;
        } else {
            let now = chrono::Utc::now().timestamp();
            job.heartbeat_at = Some(now);
            if let Err(e) = self.jobs.heartbeat(&job.job_id, now) {
                warn!("Job {}: failed to refresh heartbeat: {}", job.job_id, e);
            }
        }
        state.tracker.record(state.position);
        self.publish(job, state);
        Ok(())
    }

    fn write_checkpoint(&self, job: &mut BatchJob, state: &mut RunState) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        job.checkpoint = Some(Checkpoint {
            position: state.position,
            last_marker: state.last_marker.clone(),
            recorded_at: now,
        });
        job.heartbeat_at = Some(now);
        state.since_checkpoint = 0;
        if let Err(e) = self.jobs.update(job) {
            self.fail_job(job, state, format!("checkpoint failed: {}", e));
            return Err(e);
        }
        debug!("Job {} checkpointed at {}", job.job_id, state.position);
        Ok(())
    }

    /// Checkpoints and moves the job to `status` (paused or completed).
    fn finish(&self, job: &mut BatchJob, state: &mut RunState, status: BatchJobStatus) -> Result<()> {
        job.checkpoint = Some(Checkpoint {
            position: state.position,
            last_marker: state.last_marker.clone(),
            recorded_at: chrono::Utc::now().timestamp(),
        });
        state.since_checkpoint = 0;
        job.transition(status)?;
        self.jobs.update(job)?;
        state.tracker.record(state.position);
        self.publish(job, state);
        info!(
            "Job {} {}: {} processed, {} failed, {}/{} handled",
            job.job_id, status, job.processed_items, job.failed_items, state.position, job.total_items
        );
        Ok(())
    }

    fn fail_job(&self, job: &mut BatchJob, state: &RunState, reason: String) {
        error!("Job {} failed: {}", job.job_id, reason);
        job.failure_reason = Some(reason);
        if let Err(e) = job.transition(BatchJobStatus::Failed) {
            warn!("Job {}: {}", job.job_id, e);
        }
        if let Err(e) = self.jobs.update(job) {
            error!("Failed to record failure of job {}: {}", job.job_id, e);
        }
        self.publish(job, state);
    }

    fn publish(&self, job: &BatchJob, state: &RunState) {
        self.progress.publish(state.tracker.snapshot(job));
    }

    // =========================================================================
    // Control and inspection
    // =========================================================================

    /// Requests a stop of a job running in this engine.
    pub fn stop(&self, job_id: &str) -> Result<()> {
        if let Some(token) = self.lock_running().get(job_id) {
            info!("Stop requested for job {}", job_id);
            token.cancel();
            return Ok(());
        }
        match self.jobs.get(job_id)? {
            Some(job) => Err(LedgerError::Configuration(format!(
                "job {} is not running ({})",
                job_id, job.status
            ))),
            None => Err(LedgerError::JobNotFound(job_id.to_string())),
        }
    }

    /// Moves jobs left running by a crashed process to paused. A job whose
    /// heartbeat is younger than `stale_after_secs` may still be alive in
    /// another process and is left alone. Returns the ids of the recovered
    /// jobs.
    pub fn recover_interrupted_jobs(&self) -> Result<Vec<String>> {
        let now = chrono::Utc::now().timestamp();
        let mut recovered = Vec::new();
        for mut job in self.jobs.find_by_status(BatchJobStatus::Running)? {
            if self.lock_running().contains_key(&job.job_id) {
                continue;
            }
            if !job.is_stale(now, self.settings.stale_after_secs) {
                debug!(
                    "Job {} is running with a recent heartbeat, not recovering",
                    job.job_id
                );
                continue;
            }
            job.transition(BatchJobStatus::Paused)?;
            self.jobs.update(&job)?;
            warn!(
                "Job {} was interrupted at {}/{}, marked paused",
                job.job_id,
                job.position(),
                job.total_items
            );
            recovered.push(job.job_id);
        }
        Ok(recovered)
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<BatchJob>> {
        self.jobs.list(limit)
    }

    pub fn get_job(&self, job_id: &str) -> Result<BatchJob> {
        self.jobs
            .get(job_id)?
            .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))
    }

    /// The most recent item failures of a job.
    pub fn job_errors(&self, job_id: &str) -> Result<Vec<JobErrorEntry>> {
        Ok(self.get_job(job_id)?.error_log.entries().cloned().collect())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_idle(&self) -> Result<()> {
        if let Some(job_id) = self.lock_running().keys().next() {
            return Err(LedgerError::Configuration(format!(
                "job {} is already running",
                job_id
            )));
        }
        if let Some(job) = self.jobs.find_by_status(BatchJobStatus::Running)?.first() {
            return Err(LedgerError::Configuration(format!(
                "job {} is already running",
                job.job_id
            )));
        }
        Ok(())
    }

    fn active_version_id(&self) -> Result<Option<String>> {
        Ok(self.registry.current_active()?.map(|v| v.version_id))
    }

    fn load_resumable(&self, job_id: &str, job_type: JobType) -> Result<BatchJob> {
        let job = self.get_job(job_id)?;
        if job.job_type != job_type {
            return Err(LedgerError::Configuration(format!(
                "job {} is a {} job",
                job_id,
                job.job_type.as_str()
            )));
        }
        if !job.status.can_transition_to(BatchJobStatus::Running) {
            return Err(LedgerError::InvalidTransition {
                from: job.status.to_string(),
                to: BatchJobStatus::Running.to_string(),
            });
        }
        Ok(job)
    }
}

/// Recovers the work unit stored as a record's raw payload.
fn unit_from_record(record: DerivedRecord) -> Slot {
    let marker = record.item_id.to_string();
    let mut unit: WorkUnit = record
        .raw
        .decode()
        .map_err(|e| ItemFailure::new(marker.as_str(), FailureKind::Validation, e.to_string()))?;
    if unit.item_id != record.item_id {
        return Err(ItemFailure::new(
            marker,
            FailureKind::Validation,
            format!("raw payload belongs to {}", unit.item_id),
        ));
    }
    unit.display_name = record.name;
    unit.display_context = record.context;
    Ok(unit)
}

fn build_record(
    unit: WorkUnit,
    output: ComputedOutput,
    target: &str,
    now: i64,
) -> std::result::Result<DerivedRecord, ItemFailure> {
    let marker = unit.item_id.to_string();
    let encode_failure = |e: LedgerError| {
        ItemFailure::new(marker.as_str(), FailureKind::from(&e), e.to_string())
    };
    let raw = VersionedBlob::encode(RAW_SCHEMA_VERSION, &unit).map_err(encode_failure)?;
    let computed =
        VersionedBlob::encode(COMPUTED_SCHEMA_VERSION, &output).map_err(encode_failure)?;

    let record = DerivedRecord {
        play_count: unit.play_count(),
        first_seen: unit.first_seen(),
        last_seen: unit.last_seen(),
        item_id: unit.item_id,
        name: unit.display_name,
        group_key: unit.key.group,
        context: unit.display_context,
        raw,
        computed,
        confidence: output.confidence,
        algorithm_version: target.to_string(),
        computed_at: now,
        updated_at: now,
        is_valid: true,
        score: output.score,
        tags: unit.tags,
    };
    record
        .validate()
        .map_err(|reason| ItemFailure::new(marker.as_str(), FailureKind::Validation, reason))?;
    Ok(record)
}
