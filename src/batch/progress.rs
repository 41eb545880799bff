//! Progress estimation and fan-out to observers.

use super::job::{BatchJob, BatchJobStatus};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Smoothing factor of the throughput moving average.
pub const THROUGHPUT_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub status: BatchJobStatus,
    pub total_items: usize,
    /// Units handled so far, successes and failures alike.
    pub position: usize,
    pub processed_items: usize,
    pub failed_items: usize,
    pub elapsed_secs: f64,
    /// Smoothed items per second, once at least one chunk has been timed.
    pub throughput: Option<f64>,
    pub eta_secs: Option<f64>,
    /// Unix seconds at which the job is expected to finish.
    pub projected_completion: Option<i64>,
}

/// Tracks throughput of one job run with an exponentially weighted moving
/// average sampled at chunk boundaries.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    position: usize,
    started: Instant,
    last_sample: Instant,
    last_position: usize,
    ewma: Option<f64>,
}

impl ProgressTracker {
    /// `start_position` is non-zero for resumed jobs; items handled before
    /// the resume do not count toward throughput.
    pub fn new(total: usize, start_position: usize) -> Self {
        let now = Instant::now();
        Self {
            total,
            position: start_position,
            started: now,
            last_sample: now,
            last_position: start_position,
            ewma: None,
        }
    }

    pub fn record(&mut self, position: usize) {
        self.record_at(position, Instant::now());
    }

    pub fn record_at(&mut self, position: usize, at: Instant) {
        let delta = position.saturating_sub(self.last_position);
        let dt = at.saturating_duration_since(self.last_sample).as_secs_f64();
        if delta > 0 && dt > 0.0 {
            let rate = delta as f64 / dt;
            self.ewma = Some(match self.ewma {
                None => rate,
                Some(prev) => THROUGHPUT_ALPHA * rate + (1.0 - THROUGHPUT_ALPHA) * prev,
            });
        }
        self.position = position;
        self.last_position = position;
        self.last_sample = at;
    }

    pub fn throughput(&self) -> Option<f64> {
        self.ewma
    }

    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.total.saturating_sub(self.position);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        match self.ewma {
            Some(rate) if rate > 0.0 => Some(Duration::from_secs_f64(remaining as f64 / rate)),
            _ => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self, job: &BatchJob) -> ProgressSnapshot {
        let eta = self.eta();
        let now = chrono::Utc::now().timestamp();
        ProgressSnapshot {
            job_id: job.job_id.clone(),
            status: job.status,
            total_items: job.total_items,
            position: job.position().max(self.position),
            processed_items: job.processed_items,
            failed_items: job.failed_items,
            elapsed_secs: self.elapsed().as_secs_f64(),
            throughput: self.ewma,
            eta_secs: eta.map(|d| d.as_secs_f64()),
            projected_completion: eta.map(|d| now + d.as_secs() as i64),
        }
    }
}

/// Receives progress synchronously, on the thread running the job.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

/// Publishes snapshots to a `watch` channel and to registered observers.
pub struct ProgressHub {
    sender: watch::Sender<Option<ProgressSnapshot>>,
    observers: Mutex<Vec<Arc<dyn ProgressObserver>>>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.sender.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn ProgressObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn publish(&self, snapshot: ProgressSnapshot) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in &observers {
            observer.on_progress(&snapshot);
        }
        self.sender.send_replace(Some(snapshot));
    }
}
