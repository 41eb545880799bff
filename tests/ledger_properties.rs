mod common;

use common::{
    batch_settings, distinct_events, ConstantScorer, SelectiveScorer, TestLedger, ACTIVE_VERSION,
};
use profile_ledger::batch::{
    BatchJobStatus, BatchSettings, EventInput, JobStore, PlayCountScorer, ProgressObserver,
    ProgressSnapshot, RawEvent, Scorer, ScoringError, ScoringInput, StopHandle,
};
use profile_ledger::entity_store::{ComputedOutput, SortOrder};
use profile_ledger::{ItemId, LedgerError, RollupKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_reapplying_a_record_changes_nothing_but_updated_at() {
    let test = TestLedger::new();
    let engine = test.engine(Arc::new(PlayCountScorer), batch_settings(10));
    engine.start_ingest(distinct_events(12)).unwrap();

    let entities = &test.ledger.entities;
    let id = ItemId::from_key("Track 3", "Artist 3", "Album");
    let before = entities.get_by_identifier(&id).unwrap().unwrap();
    let fields_before = entities
        .query_by_computed_field("frequency", f64::MIN, f64::MAX, SortOrder::Ascending)
        .unwrap();

    entities.upsert(&before).unwrap();
    entities.upsert(&before).unwrap();

    let mut after = entities.get_by_identifier(&id).unwrap().unwrap();
    assert!(after.updated_at >= before.updated_at);
    after.updated_at = before.updated_at;
    assert_eq!(after, before);
    assert_eq!(entities.count().unwrap(), 12);

    let fields_after = entities
        .query_by_computed_field("frequency", f64::MIN, f64::MAX, SortOrder::Ascending)
        .unwrap();
    let ids = |records: &[profile_ledger::DerivedRecord]| {
        records.iter().map(|r| r.item_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&fields_before), ids(&fields_after));
    assert!(entities.list_tags().unwrap().is_empty());
}

#[test]
fn test_identifier_is_stable_under_case_and_whitespace() {
    let id = ItemId::from_key("Bohemian Rhapsody", "Queen", "A Night at the Opera");
    assert_eq!(
        id,
        ItemId::from_key("  bohemian   RHAPSODY ", "QUEEN", "a night  at the opera ")
    );
    assert_ne!(id, ItemId::from_key("Bohemian Rhapsody", "Queen", ""));

    let test = TestLedger::new();
    let engine = test.engine(Arc::new(PlayCountScorer), batch_settings(10));
    let job = engine
        .start_ingest(vec![
            RawEvent::new("Bohemian Rhapsody", "Queen", "A Night at the Opera", 100),
            RawEvent::new("bohemian rhapsody", " queen", "A NIGHT AT THE OPERA", 200),
        ])
        .unwrap();

    assert_eq!(job.total_items, 1);
    let record = test.ledger.entities.get_by_identifier(&id).unwrap().unwrap();
    assert_eq!(record.play_count, 2);
    assert_eq!(record.first_seen, 100);
    assert_eq!(record.last_seen, 200);
}

#[test]
fn test_recompute_converges_on_the_active_version() {
    let test = TestLedger::new();
    let engine = test.engine(Arc::new(PlayCountScorer), batch_settings(7));
    engine.start_ingest(distinct_events(50)).unwrap();

    test.activate("v2", 2);
    let registry = &test.ledger.registry;
    assert_eq!(registry.count_stale("v2").unwrap(), 50);

    let job = engine.start_recompute().unwrap();
    assert_eq!(job.status, BatchJobStatus::Completed);
    assert_eq!(job.target_version.as_deref(), Some("v2"));
    assert!(registry.find_stale("v2", 100).unwrap().is_empty());
    assert_eq!(registry.count_stale("v2").unwrap(), 0);
    assert_eq!(registry.count_stale(ACTIVE_VERSION).unwrap(), 50);
}

#[test]
fn test_one_failing_item_does_not_affect_the_others() {
    let test = TestLedger::new();
    let engine = test.engine(
        Arc::new(SelectiveScorer {
            failing_names: vec!["track 7".to_string()],
        }),
        batch_settings(4),
    );

    let job = engine.start_ingest(distinct_events(20)).unwrap();
    assert_eq!(job.status, BatchJobStatus::Completed);
    assert_eq!(job.processed_items, 19);
    assert_eq!(job.failed_items, 1);
    assert_eq!(test.ledger.entities.count().unwrap(), 19);

    let failed_id = ItemId::from_key("Track 7", "Artist 7", "Album");
    assert!(test
        .ledger
        .entities
        .get_by_identifier(&failed_id)
        .unwrap()
        .is_none());
    let errors = engine.job_errors(&job.job_id).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].marker, failed_id.to_string());
}

struct CountingScorer(AtomicUsize);

impl Scorer for CountingScorer {
    fn algorithm_hint(&self) -> &str {
        "counting"
    }

    fn score(&self, input: &ScoringInput) -> Result<ComputedOutput, ScoringError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        PlayCountScorer.score(input)
    }
}

struct StopAt {
    handle: StopHandle,
    position: usize,
}

impl ProgressObserver for StopAt {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if snapshot.position >= self.position {
            self.handle.stop();
        }
    }
}

#[test]
fn test_resume_after_stop_processes_each_item_once() {
    let test = TestLedger::new();
    let scorer = Arc::new(CountingScorer(AtomicUsize::new(0)));
    let engine = test.engine(scorer.clone(), batch_settings(4));

    let run = engine.prepare_ingest(distinct_events(25)).unwrap();
    engine.progress().add_observer(Arc::new(StopAt {
        handle: run.stop_handle(),
        position: 10,
    }));
    let paused = engine.run(run).unwrap();

    assert_eq!(paused.status, BatchJobStatus::Paused);
    assert_eq!(paused.position(), 12);
    assert_eq!(paused.processed_items, 12);
    assert_eq!(scorer.0.load(Ordering::SeqCst), 12);

    let done = engine
        .resume_ingest(&paused.job_id, distinct_events(25))
        .unwrap();
    assert_eq!(done.job_id, paused.job_id);
    assert_eq!(done.status, BatchJobStatus::Completed);
    assert_eq!(done.processed_items + done.failed_items, 25);
    assert_eq!(done.position(), 25);
    assert_eq!(scorer.0.load(Ordering::SeqCst), 25);
    assert_eq!(test.ledger.entities.count().unwrap(), 25);
}

#[test]
fn test_rollups_are_reproducible() {
    let first = TestLedger::new();
    let engine = first.engine(Arc::new(PlayCountScorer), batch_settings(8));
    engine.start_ingest(distinct_events(40)).unwrap();

    first.ledger.rollups.recompute_all().unwrap();
    let run_one: Vec<String> = first
        .ledger
        .rollups
        .all_profiles()
        .unwrap()
        .iter()
        .map(|p| p.canonical_json().unwrap())
        .collect();
    first.ledger.rollups.recompute_all().unwrap();
    let run_two: Vec<String> = first
        .ledger
        .rollups
        .all_profiles()
        .unwrap()
        .iter()
        .map(|p| p.canonical_json().unwrap())
        .collect();
    assert!(!run_one.is_empty());
    assert_eq!(run_one, run_two);

    // Same input in another ledger, in a different chunking
    let second = TestLedger::new();
    let engine = second.engine(Arc::new(PlayCountScorer), batch_settings(3));
    engine.start_ingest(distinct_events(40)).unwrap();
    second.ledger.rollups.recompute_all().unwrap();
    let elsewhere: Vec<String> = second
        .ledger
        .rollups
        .all_profiles()
        .unwrap()
        .iter()
        .map(|p| p.canonical_json().unwrap())
        .collect();
    assert_eq!(run_one, elsewhere);
}

#[test]
fn test_thousand_items_with_three_malformed() {
    let test = TestLedger::new();
    let engine = test.engine(Arc::new(ConstantScorer(50.0)), batch_settings(100));

    let mut input: Vec<EventInput> = distinct_events(1000)
        .into_iter()
        .map(EventInput::from)
        .collect();
    input[100] = EventInput::from(RawEvent::new("", "Artist 0", "Album", 1));
    input[500] = EventInput::from(RawEvent::new("Negative", "Artist 0", "Album", -1));
    input[900] = EventInput::from_json_line("{\"name\": \"Broken\"");

    let job = engine.start_ingest(input).unwrap();
    assert_eq!(job.status, BatchJobStatus::Completed);
    assert_eq!(job.total_items, 1000);
    assert_eq!(job.processed_items, 997);
    assert_eq!(job.failed_items, 3);
    assert_eq!(test.ledger.entities.count().unwrap(), 997);

    test.ledger.rollups.recompute_all().unwrap();
    let profile = test
        .ledger
        .rollups
        .get_profile(RollupKind::Group, "artist 3")
        .unwrap()
        .unwrap();
    assert_eq!(profile.item_count, 100);
    assert!((profile.weighted_score - 50.0).abs() < 1e-9);
    assert!((profile.weighted_fields["energy"] - 0.5).abs() < 1e-9);

    let stats = test.ledger.statistics.refresh().unwrap();
    assert_eq!(stats.entity_count, 997);
    assert_eq!(stats.stale_count, 0);
    let percentiles = stats.percentiles.unwrap();
    assert_eq!(percentiles.p50, 50.0);
    assert!((stats.mean_score - 50.0).abs() < 1e-9);
    assert!(stats.std_dev_score.abs() < 1e-9);
    assert_eq!(test.ledger.statistics.read().unwrap(), Some(stats));
}

/// Records the checkpoint position persisted in the job row after each chunk.
struct CheckpointWatcher {
    jobs: Arc<dyn JobStore>,
    persisted: Mutex<Vec<usize>>,
}

impl ProgressObserver for CheckpointWatcher {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let Some(job) = self.jobs.get(&snapshot.job_id).unwrap() else {
            return;
        };
        if let Some(checkpoint) = job.checkpoint {
            let mut persisted = self.persisted.lock().unwrap();
            if persisted.last() != Some(&checkpoint.position) {
                persisted.push(checkpoint.position);
            }
        }
    }
}

/// Brings the run down mid-job, the way a killed process would.
struct CrashAt(usize);

impl ProgressObserver for CrashAt {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if snapshot.position >= self.0 {
            panic!("process killed at {}", snapshot.position);
        }
    }
}

fn uneven_checkpoints() -> BatchSettings {
    BatchSettings {
        checkpoint_every: 7,
        ..batch_settings(3)
    }
}

#[test]
fn test_checkpoints_land_on_chunk_boundaries() {
    let test = TestLedger::new();
    let engine = test.engine(Arc::new(PlayCountScorer), uneven_checkpoints());
    let watcher = Arc::new(CheckpointWatcher {
        jobs: test.ledger.jobs.clone(),
        persisted: Mutex::new(Vec::new()),
    });
    engine.progress().add_observer(watcher.clone());

    let job = engine.start_ingest(distinct_events(30)).unwrap();
    assert_eq!(job.status, BatchJobStatus::Completed);
    assert_eq!(*watcher.persisted.lock().unwrap(), vec![9, 18, 27, 30]);
}

#[test]
fn test_crashed_job_resumes_from_last_checkpoint() {
    let test = TestLedger::new();
    let engine = test.engine(Arc::new(PlayCountScorer), uneven_checkpoints());
    let run = engine.prepare_ingest(distinct_events(30)).unwrap();
    let job_id = run.job().job_id.clone();
    engine.progress().add_observer(Arc::new(CrashAt(21)));

    let crashed = panic::catch_unwind(AssertUnwindSafe(|| engine.run(run)));
    assert!(crashed.is_err());

    let left = test.ledger.jobs.get(&job_id).unwrap().unwrap();
    assert_eq!(left.status, BatchJobStatus::Running);
    assert_eq!(left.position(), 18);
    assert_eq!(left.processed_items, 18);
    assert_eq!(test.ledger.entities.count().unwrap(), 21);

    // A restarted process leaves the job alone until its heartbeat goes stale
    let scorer = Arc::new(CountingScorer(AtomicUsize::new(0)));
    let restarted = test.engine(scorer.clone(), uneven_checkpoints());
    assert!(restarted.recover_interrupted_jobs().unwrap().is_empty());
    let an_hour_ago = chrono::Utc::now().timestamp() - 3_600;
    test.ledger.jobs.heartbeat(&job_id, an_hour_ago).unwrap();
    assert_eq!(restarted.recover_interrupted_jobs().unwrap(), vec![job_id.clone()]);

    let done = restarted
        .resume_ingest(&job_id, distinct_events(30))
        .unwrap();
    assert_eq!(done.status, BatchJobStatus::Completed);
    assert_eq!(done.position(), 30);
    assert_eq!(done.processed_items, 30);
    assert_eq!(done.failed_items, 0);
    assert_eq!(scorer.0.load(Ordering::SeqCst), 12);
    assert_eq!(test.ledger.entities.count().unwrap(), 30);
}

#[test]
fn test_full_database_fails_the_job_and_writes_nothing() {
    let test = TestLedger::new();
    let engine = test.engine(Arc::new(PlayCountScorer), batch_settings(50));
    let run = engine.prepare_ingest(distinct_events(50)).unwrap();
    let progress = engine.progress().subscribe();

    test.ledger
        .database()
        .write(|conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            conn.query_row(&format!("PRAGMA max_page_count = {}", pages), [], |r| {
                r.get::<_, i64>(0)
            })?;
            Ok(())
        })
        .unwrap();

    let err = engine.run(run).unwrap_err();
    assert!(matches!(err, LedgerError::Persistence(_)));
    assert_eq!(test.ledger.entities.count().unwrap(), 0);
    let last = progress.borrow().clone().unwrap();
    assert_eq!(last.status, BatchJobStatus::Failed);
    assert_eq!(last.processed_items, 0);
}
