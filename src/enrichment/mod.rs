//! External enrichment of work items with tags and features.

mod lastfm;
mod retry_policy;

pub use lastfm::LastFmEnrichmentProvider;
pub use retry_policy::RetryPolicy;

use crate::config::EnrichmentSettings;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Source of tags and features for a grouping key (an artist name).
/// Implementations may block on network I/O.
pub trait EnrichmentProvider: Send + Sync {
    fn fetch_tags(&self, name: &str) -> Result<Vec<String>>;

    fn fetch_features(&self, name: &str) -> Result<Option<Value>>;
}

/// Classified provider failures, used to decide what is worth retrying.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider error: {0}")]
    Api(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited | ProviderError::Transport(_) => true,
            ProviderError::Status(code) => *code >= 500,
            ProviderError::NotFound(_) | ProviderError::Api(_) | ProviderError::InvalidResponse(_) => {
                false
            }
        }
    }
}

/// Provider used when enrichment is not configured.
pub struct NoEnrichment;

impl EnrichmentProvider for NoEnrichment {
    fn fetch_tags(&self, _name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn fetch_features(&self, _name: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Wraps a provider with a minimum delay between calls and bounded retries.
pub struct RateLimited<P: EnrichmentProvider> {
    inner: P,
    min_interval: Duration,
    retry_policy: RetryPolicy,
    last_request: Mutex<Instant>,
}

impl<P: EnrichmentProvider> RateLimited<P> {
    pub fn new(inner: P, min_interval: Duration, retry_policy: RetryPolicy) -> Self {
        Self {
            inner,
            min_interval,
            retry_policy,
            last_request: Mutex::new(
                Instant::now()
                    .checked_sub(min_interval)
                    .unwrap_or_else(Instant::now),
            ),
        }
    }

    fn rate_limit(&self) {
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            std::thread::sleep(self.min_interval - elapsed);
        }
        *last = Instant::now();
    }

    fn with_retry<T>(&self, what: &str, name: &str, call: impl Fn(&P) -> Result<T>) -> Result<T> {
        let mut retry_count = 0;
        loop {
            self.rate_limit();
            match call(&self.inner) {
                Ok(value) => return Ok(value),
                Err(e) if self.retry_policy.should_retry(&e, retry_count) => {
                    let backoff = self.retry_policy.backoff(retry_count);
                    debug!(
                        "{} for {:?} failed ({:#}), retrying in {:?}",
                        what, name, e, backoff
                    );
                    std::thread::sleep(backoff);
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<P: EnrichmentProvider> EnrichmentProvider for RateLimited<P> {
    fn fetch_tags(&self, name: &str) -> Result<Vec<String>> {
        self.with_retry("fetch_tags", name, |p| p.fetch_tags(name))
    }

    fn fetch_features(&self, name: &str) -> Result<Option<Value>> {
        self.with_retry("fetch_features", name, |p| p.fetch_features(name))
    }
}

/// Builds the provider described by `settings`: Last.fm when an api key is
/// configured, otherwise [`NoEnrichment`].
#[cfg(not(feature = "no_enrichment"))]
pub fn build_provider(settings: &EnrichmentSettings) -> Result<Arc<dyn EnrichmentProvider>> {
    let Some(api_key) = &settings.lastfm_api_key else {
        return Ok(Arc::new(NoEnrichment));
    };
    let client =
        LastFmEnrichmentProvider::new(api_key, Duration::from_secs(settings.timeout_secs))?;
    info!(
        "Last.fm enrichment enabled ({}ms between calls)",
        settings.min_interval_ms
    );
    Ok(Arc::new(RateLimited::new(
        client,
        Duration::from_millis(settings.min_interval_ms),
        RetryPolicy::new(settings),
    )))
}

#[cfg(feature = "no_enrichment")]
pub fn build_provider(_settings: &EnrichmentSettings) -> Result<Arc<dyn EnrichmentProvider>> {
    info!("Enrichment compiled out, using NoEnrichment");
    Ok(Arc::new(NoEnrichment))
}

/// Enrichment for one grouping key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub tags: Vec<String>,
    pub features: Option<Value>,
}

/// Job-scoped cache of enrichment results keyed by grouping key.
///
/// Failures are cached too, so a failing key costs one round of retries per
/// job rather than one per item.
#[derive(Default)]
pub struct TagCache {
    entries: HashMap<String, std::result::Result<Enrichment, String>>,
    fetches: usize,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_fetch(
        &mut self,
        provider: &dyn EnrichmentProvider,
        key: &str,
    ) -> std::result::Result<Enrichment, String> {
        if let Some(entry) = self.entries.get(key) {
            return entry.clone();
        }
        self.fetches += 1;
        let result = provider
            .fetch_tags(key)
            .and_then(|tags| {
                let features = provider.fetch_features(key)?;
                Ok(Enrichment { tags, features })
            })
            .map_err(|e| format!("{:#}", e));
        if let Err(message) = &result {
            warn!("Enrichment for {:?} failed: {}", key, message);
        }
        self.entries.insert(key.to_string(), result.clone());
        result
    }

    /// Number of provider lookups performed (cache misses).
    pub fn fetches(&self) -> usize {
        self.fetches
    }
}
