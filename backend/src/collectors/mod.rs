//! Collector framework.
//!
//! Every data source implements [`Collector`]; the aggregator wraps each one
//! in a [`SourceRunner`] that layers on the shared behavior: TTL cache,
//! circuit-gated fetch, bounded exponential retry, stale-cache fallback, and
//! per-source health accounting. A collector that fails a whole cycle yields
//! its stale cache when one exists, otherwise an empty FeatureCollection —
//! errors never escape the runner.

pub mod aredn;
pub mod hamclock;
pub mod meshtastic;
pub mod noaa_alerts;
pub mod reticulum;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::now_secs;
use crate::geojson::FeatureCollection;

/// User agent sent on every upstream HTTP request.
pub const USER_AGENT: &str = concat!("MeshForge-Maps/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Fetch fresh data from the source. Cache, retries, and circuit
    /// protection live in the runner, not here.
    async fn fetch(&self) -> Result<FeatureCollection, FetchError>;
}

// Collectors shared with other components (AREDN topology) run behind Arcs.
#[async_trait]
impl<T: Collector + ?Sized> Collector for Arc<T> {
    fn source_name(&self) -> &'static str {
        (**self).source_name()
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        (**self).fetch().await
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

struct CacheState {
    cache: Option<FeatureCollection>,
    cache_time: f64,
}

#[derive(Default)]
struct HealthState {
    total_collections: u64,
    total_errors: u64,
    last_error: Option<String>,
    last_success_time: Option<f64>,
}

pub struct CollectOutcome {
    pub collection: FeatureCollection,
    pub from_cache: bool,
}

pub struct SourceRunner {
    collector: Box<dyn Collector>,
    breaker: Arc<CircuitBreaker>,
    cache_ttl: f64,
    retry: RetryPolicy,
    // tokio mutex: held across the fetch so concurrent collect calls for
    // the same source coalesce instead of stampeding the upstream
    state: tokio::sync::Mutex<CacheState>,
    health: Mutex<HealthState>,
}

impl SourceRunner {
    pub fn new(
        collector: Box<dyn Collector>,
        breaker: Arc<CircuitBreaker>,
        cache_ttl_seconds: f64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            collector,
            breaker,
            cache_ttl: cache_ttl_seconds,
            retry,
            state: tokio::sync::Mutex::new(CacheState {
                cache: None,
                cache_time: 0.0,
            }),
            health: Mutex::new(HealthState::default()),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.collector.source_name()
    }

    pub async fn collect(&self) -> FeatureCollection {
        self.collect_with_meta().await.collection
    }

    /// Cache-fresh → cached data; otherwise fetch under the circuit breaker
    /// with retries; on exhaustion fall back to stale cache or empty.
    pub async fn collect_with_meta(&self) -> CollectOutcome {
        let name = self.source_name();
        let mut state = self.state.lock().await;
        let now = now_secs();

        if let Some(cache) = &state.cache {
            if now - state.cache_time < self.cache_ttl {
                debug!("{name}: returning cached data");
                return CollectOutcome {
                    collection: cache.clone(),
                    from_cache: true,
                };
            }
        }

        if !self.breaker.can_execute() {
            debug!("{name}: circuit open, skipping fetch");
            return self.fallback(&state, "circuit open");
        }

        match self.fetch_with_retries().await {
            Ok(collection) => {
                self.breaker.record_success();
                {
                    let mut health = self.health.lock().unwrap();
                    health.total_collections += 1;
                    health.last_success_time = Some(now);
                    health.last_error = None;
                }
                info!("{name}: collected {} nodes", collection.features.len());
                state.cache = Some(collection.clone());
                state.cache_time = now;
                CollectOutcome {
                    collection,
                    from_cache: false,
                }
            }
            Err(e) => {
                self.breaker.record_failure();
                {
                    let mut health = self.health.lock().unwrap();
                    health.total_errors += 1;
                    health.last_error = Some(e.to_string());
                }
                warn!("{name}: collection failed: {e}");
                self.fallback(&state, &e.to_string())
            }
        }
    }

    fn fallback(&self, state: &CacheState, reason: &str) -> CollectOutcome {
        let name = self.source_name();
        match &state.cache {
            Some(cache) => {
                warn!("{name}: returning stale cache ({reason})");
                CollectOutcome {
                    collection: cache.clone(),
                    from_cache: true,
                }
            }
            None => CollectOutcome {
                collection: FeatureCollection::empty(name),
                from_cache: false,
            },
        }
    }

    async fn fetch_with_retries(&self) -> Result<FeatureCollection, FetchError> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            match self.collector.fetch().await {
                Ok(collection) => return Ok(collection),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        return Err(e);
                    }
                    debug!(
                        "{}: fetch attempt {attempt} failed ({e}), retrying in {:?}",
                        self.source_name(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.retry.multiplier);
                }
            }
        }
    }

    pub fn health_info(&self) -> Map<String, Value> {
        let health = self.health.lock().unwrap();
        let mut info = Map::new();
        info.insert("source".into(), json!(self.source_name()));
        info.insert("total_collections".into(), json!(health.total_collections));
        info.insert("total_errors".into(), json!(health.total_errors));
        info.insert("last_error".into(), json!(health.last_error));
        info.insert("last_success_time".into(), json!(health.last_success_time));
        info.insert("circuit_state".into(), json!(self.breaker.state().as_str()));
        info
    }

    pub async fn clear_cache(&self) {
        let mut state = self.state.lock().await;
        state.cache = None;
        state.cache_time = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geojson::node_feature;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted collector: fails `fail_first` times, then succeeds.
    struct Scripted {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Collector for Scripted {
        fn source_name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(FetchError::Http("scripted failure".into()))
            } else {
                Ok(FeatureCollection::new(
                    vec![node_feature("!n1", 40.0, -105.0, "test", "", "node", Map::new())],
                    "scripted",
                ))
            }
        }
    }

    fn runner(fail_first: u32, cache_ttl: f64) -> SourceRunner {
        SourceRunner::new(
            Box::new(Scripted {
                fail_first,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CircuitBreaker::new("scripted", 5, 60.0)),
            cache_ttl,
            RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                multiplier: 2.0,
            },
        )
    }

    #[tokio::test]
    async fn caches_successful_fetch() {
        let runner = runner(0, 900.0);
        let first = runner.collect_with_meta().await;
        assert!(!first.from_cache);
        assert_eq!(first.collection.features.len(), 1);

        let second = runner.collect_with_meta().await;
        assert!(second.from_cache);

        let health = runner.health_info();
        assert_eq!(health["total_collections"], json!(1));
        assert_eq!(health["total_errors"], json!(0));
    }

    #[tokio::test]
    async fn retries_within_budget_then_succeeds() {
        // 2 failures fit inside the 2-retry budget
        let runner = runner(2, 900.0);
        let outcome = runner.collect_with_meta().await;
        assert!(!outcome.from_cache);
        assert_eq!(outcome.collection.features.len(), 1);
        assert_eq!(runner.health_info()["total_errors"], json!(0));
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_empty() {
        let runner = runner(10, 900.0);
        let outcome = runner.collect_with_meta().await;
        assert!(outcome.collection.features.is_empty());
        let health = runner.health_info();
        assert_eq!(health["total_errors"], json!(1));
        assert!(health["last_error"].as_str().unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn stale_cache_served_when_fetch_fails() {
        // First call succeeds, cache expires immediately, then all fail
        let runner = SourceRunner::new(
            Box::new(Scripted {
                fail_first: 0,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CircuitBreaker::new("scripted", 5, 60.0)),
            0.0,
            RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                multiplier: 2.0,
            },
        );
        let first = runner.collect_with_meta().await;
        assert_eq!(first.collection.features.len(), 1);

        // swap in permanent failure by tripping the breaker open
        for _ in 0..5 {
            // failing fetches exhaust immediately (max_retries = 0) but the
            // scripted collector now always succeeds; instead verify the
            // circuit-open path serves the stale cache
            runner.breaker.record_failure();
        }
        let outcome = runner.collect_with_meta().await;
        assert!(outcome.from_cache);
        assert_eq!(outcome.collection.features.len(), 1);
    }
}
