//! Retry policy for enrichment calls.
//!
//! Implements exponential backoff with configurable parameters.

use super::ProviderError;
use crate::config::EnrichmentSettings;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Cap for exponential growth.
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &EnrichmentSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff_ms: settings.initial_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// `initial_backoff * multiplier^retry_count`, capped at `max_backoff_ms`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let backoff =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry_count as i32);
        Duration::from_millis(backoff.min(self.max_backoff_ms as f64) as u64)
    }

    /// True if the error is transient and retries are left.
    pub fn should_retry(&self, error: &anyhow::Error, retry_count: u32) -> bool {
        let retryable = match error.downcast_ref::<ProviderError>() {
            Some(provider_error) => provider_error.is_retryable(),
            // Transport errors that were never classified are assumed transient
            None => true,
        };
        retryable && retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&EnrichmentSettings::default())
    }
}
