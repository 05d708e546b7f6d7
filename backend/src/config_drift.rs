//! Node configuration drift detection.
//!
//! Keeps a per-node snapshot of tracked config fields and emits a
//! severity-tagged drift record whenever a tracked field changes between
//! observations. Sources: node info (role, names, hardware) and map
//! reports (LoRa region, modem preset, channel settings).

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::clock::now_secs;

pub const MAX_DRIFT_HISTORY: usize = 50;
pub const MAX_TRACKED_NODES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSeverity {
    Info,
    Warning,
    Critical,
}

impl DriftSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Tracked fields and the severity of a change to each.
pub const TRACKED_FIELDS: [(&str, DriftSeverity); 12] = [
    ("role", DriftSeverity::Warning),
    ("hardware", DriftSeverity::Warning),
    ("name", DriftSeverity::Info),
    ("short_name", DriftSeverity::Info),
    ("region", DriftSeverity::Critical),
    ("modem_preset", DriftSeverity::Critical),
    ("hop_limit", DriftSeverity::Warning),
    ("tx_power", DriftSeverity::Warning),
    ("tx_enabled", DriftSeverity::Warning),
    ("channel_name", DriftSeverity::Critical),
    ("uplink_enabled", DriftSeverity::Info),
    ("downlink_enabled", DriftSeverity::Info),
];

fn field_severity(field: &str) -> Option<DriftSeverity> {
    TRACKED_FIELDS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, severity)| *severity)
}

/// Normalize a value for comparison so `1` and `1.0` are equal.
fn normalize_value(value: &Value) -> String {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 9e15 {
                    return format!("{}", f as i64);
                }
            }
            n.to_string()
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct NodeSnapshot {
    fields: Map<String, Value>,
    last_seen: f64,
}

type DriftCallback = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

pub struct ConfigDriftDetector {
    max_history: usize,
    max_nodes: usize,
    snapshots: Mutex<HashMap<String, NodeSnapshot>>,
    drift_history: Mutex<HashMap<String, VecDeque<Value>>>,
    total_drifts: Mutex<u64>,
    on_drift: Mutex<Option<DriftCallback>>,
}

impl Default for ConfigDriftDetector {
    fn default() -> Self {
        Self::new(MAX_DRIFT_HISTORY, MAX_TRACKED_NODES)
    }
}

impl ConfigDriftDetector {
    pub fn new(max_history: usize, max_nodes: usize) -> Self {
        Self {
            max_history,
            max_nodes,
            snapshots: Mutex::new(HashMap::new()),
            drift_history: Mutex::new(HashMap::new()),
            total_drifts: Mutex::new(0),
            on_drift: Mutex::new(None),
        }
    }

    pub fn set_drift_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        *self.on_drift.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Compare a node's current fields against its snapshot. Only tracked,
    /// non-null fields participate. The first observation records the
    /// snapshot and returns no drifts.
    pub fn check_node(&self, node_id: &str, fields: &Map<String, Value>) -> Vec<Value> {
        let current: Map<String, Value> = fields
            .iter()
            .filter(|(key, value)| field_severity(key).is_some() && !value.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if current.is_empty() {
            return Vec::new();
        }

        let now = now_secs();
        let mut drifts: Vec<Value> = Vec::new();

        {
            let mut snapshots = self.snapshots.lock().unwrap();
            match snapshots.get_mut(node_id) {
                None => {
                    if snapshots.len() >= self.max_nodes {
                        let evicted = Self::evict_oldest_locked(&mut snapshots);
                        if let Some(evicted) = evicted {
                            self.drift_history.lock().unwrap().remove(&evicted);
                        }
                    }
                    snapshots.insert(
                        node_id.to_string(),
                        NodeSnapshot {
                            fields: current,
                            last_seen: now,
                        },
                    );
                    return Vec::new();
                }
                Some(snapshot) => {
                    for (field, new_value) in &current {
                        // A tracked field reported for the first time after
                        // the initial snapshot counts as a change too
                        let old_value = snapshot.fields.get(field).cloned().unwrap_or(Value::Null);
                        if !old_value.is_null()
                            && normalize_value(&old_value) == normalize_value(new_value)
                        {
                            continue;
                        }
                        let severity = field_severity(field).unwrap_or(DriftSeverity::Info);
                        info!(
                            "config drift [{}] {field}: {old_value} -> {new_value} ({node_id})",
                            severity.as_str()
                        );
                        drifts.push(json!({
                            "node_id": node_id,
                            "field": field,
                            "old_value": old_value,
                            "new_value": new_value,
                            "severity": severity.as_str(),
                            "timestamp": now,
                        }));
                    }
                    for (field, value) in current {
                        snapshot.fields.insert(field, value);
                    }
                    snapshot.last_seen = now;
                }
            }
        }

        if !drifts.is_empty() {
            *self.total_drifts.lock().unwrap() += drifts.len() as u64;
            let mut history = self.drift_history.lock().unwrap();
            let ring = history
                .entry(node_id.to_string())
                .or_insert_with(|| VecDeque::with_capacity(self.max_history));
            for drift in &drifts {
                if ring.len() == self.max_history {
                    ring.pop_front();
                }
                ring.push_back(drift.clone());
            }
        }

        // Notify outside the locks
        if !drifts.is_empty() {
            let callback = self.on_drift.lock().unwrap().clone();
            if let Some(cb) = callback {
                if catch_unwind(AssertUnwindSafe(|| cb(node_id, &drifts))).is_err() {
                    warn!("drift callback panicked for {node_id}");
                }
            }
        }

        drifts
    }

    pub fn get_node_snapshot(&self, node_id: &str) -> Option<Map<String, Value>> {
        self.snapshots
            .lock()
            .unwrap()
            .get(node_id)
            .map(|snapshot| snapshot.fields.clone())
    }

    pub fn get_node_drift_history(&self, node_id: &str) -> Vec<Value> {
        self.drift_history
            .lock()
            .unwrap()
            .get(node_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All drift events, newest first, optionally filtered.
    pub fn get_all_drifts(&self, since: Option<f64>, severity: Option<&str>) -> Vec<Value> {
        let history = self.drift_history.lock().unwrap();
        let mut result: Vec<Value> = history
            .values()
            .flatten()
            .filter(|drift| {
                if let Some(since) = since {
                    if drift.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0) < since {
                        return false;
                    }
                }
                if let Some(severity) = severity {
                    if drift.get("severity").and_then(Value::as_str) != Some(severity) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            let ta = a.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            let tb = b.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
        });
        result
    }

    pub fn get_summary(&self) -> Value {
        let snapshots = self.snapshots.lock().unwrap();
        let history = self.drift_history.lock().unwrap();
        let nodes_with_drift = history.values().filter(|h| !h.is_empty()).count();
        let mut recent: Vec<Value> = history
            .values()
            .flat_map(|ring| ring.iter().rev().take(3).cloned())
            .collect();
        recent.sort_by(|a, b| {
            let ta = a.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            let tb = b.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
        });
        recent.truncate(10);

        json!({
            "tracked_nodes": snapshots.len(),
            "nodes_with_drift": nodes_with_drift,
            "total_drifts": *self.total_drifts.lock().unwrap(),
            "recent_drifts": recent,
        })
    }

    pub fn tracked_node_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn remove_node(&self, node_id: &str) {
        self.snapshots.lock().unwrap().remove(node_id);
        self.drift_history.lock().unwrap().remove(node_id);
    }

    fn evict_oldest_locked(snapshots: &mut HashMap<String, NodeSnapshot>) -> Option<String> {
        let oldest = snapshots
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_seen
                    .partial_cmp(&b.last_seen)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| id.clone())?;
        snapshots.remove(&oldest);
        Some(oldest)
    }
}
