//! Per-source circuit breakers for the data collectors.
//!
//! When a source accumulates consecutive failures the circuit opens and
//! requests are rejected, preventing timeout cascades across collection
//! cycles. After the recovery timeout the circuit half-opens to probe the
//! source again.
//!
//! States:
//!   CLOSED    -> normal operation, requests pass through
//!   OPEN      -> source is failing, requests are rejected
//!   HALF_OPEN -> testing recovery, one request allowed through

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::clock::now_secs;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: f64 = 60.0;

/// Maximum tracked breakers before the registry evicts.
pub const MAX_CIRCUITS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: f64,
    last_state_change: f64,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl BreakerInner {
    fn transition_to(&mut self, new_state: CircuitState) {
        self.state = new_state;
        self.last_state_change = now_secs();
    }
}

/// Per-source circuit breaker with failure counting and auto-recovery.
/// All state mutations are protected by a lock.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: f64,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, recovery_timeout: f64) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: 0.0,
                last_state_change: now_secs(),
                total_successes: 0,
                total_failures: 0,
                total_rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.check_recovery(&mut inner);
        inner.state
    }

    /// Whether a request is allowed through. OPEN circuits reject and count
    /// the rejection; CLOSED and HALF_OPEN pass.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.check_recovery(&mut inner);
        if inner.state == CircuitState::Open {
            inner.total_rejected += 1;
            return false;
        }
        true
    }

    /// Record a successful operation; resets the failure count and closes a
    /// half-open circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_successes += 1;
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.transition_to(CircuitState::Closed);
            info!("circuit breaker '{}' recovered -> CLOSED", self.name);
        } else if inner.state != CircuitState::Closed {
            inner.transition_to(CircuitState::Closed);
        }
    }

    /// Record a failed operation; opens the circuit at the threshold or on
    /// a failed half-open probe.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure_time = now_secs();

        if inner.state == CircuitState::HalfOpen {
            inner.transition_to(CircuitState::Open);
            warn!("circuit breaker '{}' recovery failed -> OPEN", self.name);
        } else if inner.state == CircuitState::Closed
            && inner.failure_count >= self.failure_threshold
        {
            let failures = inner.failure_count;
            inner.transition_to(CircuitState::Open);
            warn!(
                "circuit breaker '{}' tripped ({failures} failures) -> OPEN",
                self.name
            );
        }
    }

    /// Manually reset to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        inner.transition_to(CircuitState::Closed);
    }

    pub fn stats(&self) -> Map<String, Value> {
        let mut inner = self.inner.lock().unwrap();
        self.check_recovery(&mut inner);
        let mut stats = Map::new();
        stats.insert("name".into(), json!(self.name));
        stats.insert("state".into(), json!(inner.state.as_str()));
        stats.insert("failure_count".into(), json!(inner.failure_count));
        stats.insert("failure_threshold".into(), json!(self.failure_threshold));
        stats.insert("recovery_timeout".into(), json!(self.recovery_timeout));
        stats.insert("total_successes".into(), json!(inner.total_successes));
        stats.insert("total_failures".into(), json!(inner.total_failures));
        stats.insert("total_rejected".into(), json!(inner.total_rejected));
        stats.insert(
            "last_failure_time".into(),
            if inner.last_failure_time > 0.0 {
                json!(inner.last_failure_time)
            } else {
                Value::Null
            },
        );
        stats.insert("last_state_change".into(), json!(inner.last_state_change));
        stats
    }

    fn last_state_change(&self) -> f64 {
        self.inner.lock().unwrap().last_state_change
    }

    /// OPEN -> HALF_OPEN once the recovery timeout has elapsed. Must be
    /// called with the lock held.
    fn check_recovery(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if now_secs() - inner.last_failure_time >= self.recovery_timeout {
            inner.transition_to(CircuitState::HalfOpen);
            info!(
                "circuit breaker '{}' recovery timeout elapsed -> HALF_OPEN",
                self.name
            );
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Registry of named circuit breakers for all data sources. Bounded at
/// [`MAX_CIRCUITS`]; when full, the oldest CLOSED breaker is evicted.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_failure_threshold: u32,
    default_recovery_timeout: f64,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_failure_threshold: u32, default_recovery_timeout: f64) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            default_failure_threshold,
            default_recovery_timeout,
        }
    }

    /// Get or create a breaker by name.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, None, None)
    }

    pub fn get_with(
        &self,
        name: &str,
        failure_threshold: Option<u32>,
        recovery_timeout: Option<f64>,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }
        if breakers.len() >= MAX_CIRCUITS {
            Self::evict_oldest_closed(&mut breakers);
        }
        let breaker = Arc::new(CircuitBreaker::new(
            name,
            failure_threshold.unwrap_or(self.default_failure_threshold),
            recovery_timeout.unwrap_or(self.default_recovery_timeout),
        ));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get_all_states(&self) -> Map<String, Value> {
        let breakers = self.breakers.lock().unwrap();
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), Value::Object(b.stats())))
            .collect()
    }

    /// Breakers that are currently OPEN or HALF_OPEN.
    pub fn get_open_circuits(&self) -> Map<String, Value> {
        let breakers = self.breakers.lock().unwrap();
        breakers
            .iter()
            .filter(|(_, b)| b.state() != CircuitState::Closed)
            .map(|(name, b)| (name.clone(), Value::Object(b.stats())))
            .collect()
    }

    /// Reset one breaker by name. Returns whether it existed.
    pub fn reset(&self, name: &str) -> bool {
        let breakers = self.breakers.lock().unwrap();
        match breakers.get(name) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker; returns how many were not already CLOSED.
    pub fn reset_all(&self) -> usize {
        let breakers = self.breakers.lock().unwrap();
        let mut count = 0;
        for breaker in breakers.values() {
            if breaker.state() != CircuitState::Closed {
                breaker.reset();
                count += 1;
            }
        }
        count
    }

    fn evict_oldest_closed(breakers: &mut HashMap<String, Arc<CircuitBreaker>>) {
        let oldest = breakers
            .iter()
            .filter(|(_, b)| b.state() == CircuitState::Closed)
            .min_by(|(_, a), (_, b)| {
                a.last_state_change()
                    .partial_cmp(&b.last_state_change())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.clone());
        if let Some(name) = oldest {
            breakers.remove(&name);
            debug!("evicted circuit breaker '{name}' (capacity limit)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn trips_at_threshold() {
        let cb = CircuitBreaker::new("test", 3, 60.0);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", 3, 60.0);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn rejections_increase_monotonically_while_open() {
        let cb = CircuitBreaker::new("test", 1, 60.0);
        cb.record_failure();
        let mut last = 0u64;
        for _ in 0..3 {
            assert!(!cb.can_execute());
            let rejected = cb.stats()["total_rejected"].as_u64().unwrap();
            assert!(rejected > last);
            last = rejected;
        }
    }

    #[test]
    fn reopen_after_failed_half_open_probe() {
        let cb = CircuitBreaker::new("test", 1, 0.1);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(150));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_success_closes() {
        let cb = CircuitBreaker::new("test", 1, 0.05);
        cb.record_failure();
        sleep(Duration::from_millis(80));
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("meshtastic");
        let b = registry.get("meshtastic");
        a.record_failure();
        assert_eq!(b.stats()["total_failures"], json!(1));
    }

    #[test]
    fn registry_reset_all_counts_non_closed() {
        let registry = CircuitBreakerRegistry::new(1, 60.0);
        registry.get("a").record_failure();
        registry.get("b");
        assert_eq!(registry.get_open_circuits().len(), 1);
        assert_eq!(registry.reset_all(), 1);
        assert_eq!(registry.get_open_circuits().len(), 0);
    }
}
