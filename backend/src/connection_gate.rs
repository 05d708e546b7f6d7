//! Exclusive-access gate for the meshtasticd TCP endpoint.
//!
//! meshtasticd accepts a single TCP client at a time; the maps collector and
//! any co-resident gateway must take turns. The gate is a cooperative
//! timed mutex keyed by `host:port`. The registry is plain state owned by
//! the orchestrator and passed to consumers — there is no module-level
//! global.
//!
//! Usage:
//!     let gate = registry.gate("localhost", 4403);
//!     let handle = gate.acquire(5.0, "maps_collector").await;
//!     if handle.acquired() {
//!         // safe to talk to meshtasticd; released on drop
//!     }

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::clock::now_secs;

#[derive(Default)]
struct GateStats {
    holder: Option<String>,
    acquire_time: f64,
    total_acquisitions: u64,
    total_timeouts: u64,
    total_releases: u64,
}

pub struct ConnectionGate {
    host: String,
    port: u16,
    lock: Arc<AsyncMutex<()>>,
    stats: Mutex<GateStats>,
}

impl ConnectionGate {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            lock: Arc::new(AsyncMutex::new(())),
            stats: Mutex::new(GateStats::default()),
        }
    }

    /// Try to acquire the gate within `timeout` seconds (0 = non-blocking
    /// try). The returned handle reports whether the gate was won and
    /// releases it on drop, error paths included.
    pub async fn acquire(self: &Arc<Self>, timeout: f64, holder: &str) -> GateHandle {
        let guard = if timeout <= 0.0 {
            Arc::clone(&self.lock).try_lock_owned().ok()
        } else {
            tokio::time::timeout(
                Duration::from_secs_f64(timeout),
                Arc::clone(&self.lock).lock_owned(),
            )
            .await
            .ok()
        };

        match guard {
            Some(guard) => {
                let mut stats = self.stats.lock().unwrap();
                stats.holder = Some(if holder.is_empty() { "unknown" } else { holder }.to_string());
                stats.acquire_time = now_secs();
                stats.total_acquisitions += 1;
                debug!(
                    "connection gate acquired by '{holder}' for {}:{}",
                    self.host, self.port
                );
                GateHandle {
                    gate: Arc::clone(self),
                    guard: Some(guard),
                }
            }
            None => {
                let mut stats = self.stats.lock().unwrap();
                stats.total_timeouts += 1;
                debug!(
                    "connection gate timeout ({timeout:.1}s) for {}:{}, held by '{}'",
                    self.host,
                    self.port,
                    stats.holder.as_deref().unwrap_or("unknown")
                );
                GateHandle {
                    gate: Arc::clone(self),
                    guard: None,
                }
            }
        }
    }

    /// Name of the current holder, if any. Diagnostic only — inherently
    /// racy.
    pub fn holder(&self) -> Option<String> {
        self.stats.lock().unwrap().holder.clone()
    }

    pub fn stats(&self) -> Map<String, Value> {
        let stats = self.stats.lock().unwrap();
        let held_seconds = if stats.acquire_time > 0.0 && stats.holder.is_some() {
            json!(((now_secs() - stats.acquire_time).max(0.0) * 10.0).round() / 10.0)
        } else {
            Value::Null
        };
        let mut out = Map::new();
        out.insert("host".into(), json!(self.host));
        out.insert("port".into(), json!(self.port));
        out.insert("is_locked".into(), json!(stats.holder.is_some()));
        out.insert("holder".into(), json!(stats.holder));
        out.insert("held_seconds".into(), held_seconds);
        out.insert("total_acquisitions".into(), json!(stats.total_acquisitions));
        out.insert("total_timeouts".into(), json!(stats.total_timeouts));
        out.insert("total_releases".into(), json!(stats.total_releases));
        out
    }

    fn record_release(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.holder = None;
        stats.acquire_time = 0.0;
        stats.total_releases += 1;
    }
}

/// Scoped gate handle; dropping it releases the gate when it was acquired.
pub struct GateHandle {
    gate: Arc<ConnectionGate>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl GateHandle {
    pub fn acquired(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            self.gate.record_release();
        }
    }
}

/// One gate per `host:port` pair, shared by every consumer of that
/// endpoint.
#[derive(Default)]
pub struct GateRegistry {
    gates: Mutex<HashMap<String, Arc<ConnectionGate>>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, host: &str, port: u16) -> Arc<ConnectionGate> {
        let key = format!("{host}:{port}");
        let mut gates = self.gates.lock().unwrap();
        Arc::clone(
            gates
                .entry(key)
                .or_insert_with(|| Arc::new(ConnectionGate::new(host, port))),
        )
    }

    pub fn stats(&self) -> Map<String, Value> {
        let gates = self.gates.lock().unwrap();
        gates
            .iter()
            .map(|(key, gate)| (key.clone(), Value::Object(gate.stats())))
            .collect()
    }
}
