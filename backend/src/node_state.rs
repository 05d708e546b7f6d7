//! Per-node connectivity state machine.
//!
//! Classifies each node from its heartbeat regularity:
//!   NEW          — first observations, not enough data to classify
//!   STABLE       — regular heartbeats
//!   INTERMITTENT — gap ratio at or above the intermittent threshold
//!   OFFLINE      — unseen past the offline threshold (external scan)
//!
//! `record_heartbeat` drives classification; `check_offline` is called
//! periodically by the maintenance loop. Transition callbacks fire outside
//! the lock inside a failure boundary.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::clock::now_secs;

/// Sliding window of retained heartbeats per node.
pub const MAX_HEARTBEAT_WINDOW: usize = 20;
pub const MAX_TRACKED_NODES: usize = 10_000;

/// Nominal period between mesh node broadcasts.
pub const DEFAULT_EXPECTED_INTERVAL: f64 = 300.0;
pub const DEFAULT_OFFLINE_THRESHOLD: f64 = 3600.0;
pub const DEFAULT_INTERMITTENT_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    New,
    Stable,
    Intermittent,
    Offline,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Stable => "stable",
            Self::Intermittent => "intermittent",
            Self::Offline => "offline",
        }
    }
}

struct StateEntry {
    node_id: String,
    state: NodeState,
    heartbeats: VecDeque<f64>,
    first_seen: f64,
    last_seen: f64,
    transition_count: u64,
}

impl StateEntry {
    fn new(node_id: &str, timestamp: f64) -> Self {
        let mut heartbeats = VecDeque::with_capacity(MAX_HEARTBEAT_WINDOW);
        heartbeats.push_back(timestamp);
        Self {
            node_id: node_id.to_string(),
            state: NodeState::New,
            heartbeats,
            first_seen: timestamp,
            last_seen: timestamp,
            transition_count: 0,
        }
    }

    fn add_heartbeat(&mut self, timestamp: f64) {
        if self.heartbeats.len() == MAX_HEARTBEAT_WINDOW {
            self.heartbeats.pop_front();
        }
        self.heartbeats.push_back(timestamp);
        self.last_seen = timestamp;
    }

    fn average_interval(&self) -> Option<f64> {
        if self.heartbeats.len() < 2 {
            return None;
        }
        let intervals = self.heartbeats.len() - 1;
        let span = self.heartbeats.back()? - self.heartbeats.front()?;
        Some(span / intervals as f64)
    }

    /// Fraction of consecutive intervals exceeding twice the expected
    /// interval. 0.0 = fully regular, 1.0 = every interval is a gap.
    fn gap_ratio(&self, expected_interval: f64) -> f64 {
        if self.heartbeats.len() < 2 {
            return 0.0;
        }
        let gap_threshold = expected_interval * 2.0;
        let mut gaps = 0usize;
        let mut intervals = 0usize;
        let mut prev = None;
        for &ts in &self.heartbeats {
            if let Some(prev) = prev {
                intervals += 1;
                if ts - prev > gap_threshold {
                    gaps += 1;
                }
            }
            prev = Some(ts);
        }
        gaps as f64 / intervals as f64
    }

    fn to_value(&self) -> Value {
        json!({
            "node_id": self.node_id,
            "state": self.state.as_str(),
            "heartbeat_count": self.heartbeats.len(),
            "first_seen": self.first_seen,
            "last_seen": self.last_seen,
            "average_interval": self.average_interval().map(|v| (v * 10.0).round() / 10.0),
            "transition_count": self.transition_count,
        })
    }
}

type TransitionCallback = Arc<dyn Fn(&str, NodeState, NodeState) + Send + Sync>;

pub struct NodeStateTracker {
    expected_interval: f64,
    offline_threshold: f64,
    intermittent_ratio: f64,
    max_nodes: usize,
    nodes: Mutex<HashMap<String, StateEntry>>,
    total_transitions: Mutex<u64>,
    on_transition: Mutex<Option<TransitionCallback>>,
}

impl Default for NodeStateTracker {
    fn default() -> Self {
        Self::new(
            DEFAULT_EXPECTED_INTERVAL,
            DEFAULT_OFFLINE_THRESHOLD,
            DEFAULT_INTERMITTENT_RATIO,
            MAX_TRACKED_NODES,
        )
    }
}

impl NodeStateTracker {
    pub fn new(
        expected_interval: f64,
        offline_threshold: f64,
        intermittent_ratio: f64,
        max_nodes: usize,
    ) -> Self {
        Self {
            expected_interval,
            offline_threshold,
            intermittent_ratio,
            max_nodes,
            nodes: Mutex::new(HashMap::new()),
            total_transitions: Mutex::new(0),
            on_transition: Mutex::new(None),
        }
    }

    pub fn set_transition_callback<F>(&self, callback: F)
    where
        F: Fn(&str, NodeState, NodeState) + Send + Sync + 'static,
    {
        *self.on_transition.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn offline_threshold(&self) -> f64 {
        self.offline_threshold
    }

    /// Record one heartbeat and reclassify. Returns `(old, new)` states.
    pub fn record_heartbeat(&self, node_id: &str, timestamp: Option<f64>) -> (NodeState, NodeState) {
        let timestamp = timestamp.unwrap_or_else(now_secs);
        let transition = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(node_id) {
                None => {
                    if nodes.len() >= self.max_nodes {
                        Self::evict_oldest_locked(&mut nodes);
                    }
                    nodes.insert(node_id.to_string(), StateEntry::new(node_id, timestamp));
                    return (NodeState::New, NodeState::New);
                }
                Some(entry) => {
                    let old_state = entry.state;
                    entry.add_heartbeat(timestamp);
                    let new_state = self.classify(entry);
                    if new_state != old_state {
                        entry.state = new_state;
                        entry.transition_count += 1;
                        *self.total_transitions.lock().unwrap() += 1;
                        Some((old_state, new_state))
                    } else {
                        None
                    }
                }
            }
        };

        match transition {
            Some((old, new)) => {
                self.fire_callback(node_id, old, new);
                (old, new)
            }
            None => {
                let state = self.get_node_state(node_id).unwrap_or(NodeState::New);
                (state, state)
            }
        }
    }

    /// Transition every node unseen past the offline threshold to OFFLINE.
    /// Returns the ids that transitioned. Call this from a periodic scan.
    pub fn check_offline(&self, now: Option<f64>) -> Vec<String> {
        let now = now.unwrap_or_else(now_secs);
        let mut transitions = Vec::new();
        {
            let mut nodes = self.nodes.lock().unwrap();
            for entry in nodes.values_mut() {
                if entry.state == NodeState::Offline {
                    continue;
                }
                if now - entry.last_seen > self.offline_threshold {
                    let old = entry.state;
                    entry.state = NodeState::Offline;
                    entry.transition_count += 1;
                    *self.total_transitions.lock().unwrap() += 1;
                    transitions.push((entry.node_id.clone(), old));
                }
            }
        }
        for (node_id, old) in &transitions {
            self.fire_callback(node_id, *old, NodeState::Offline);
        }
        transitions.into_iter().map(|(id, _)| id).collect()
    }

    pub fn get_node_state(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.lock().unwrap().get(node_id).map(|e| e.state)
    }

    pub fn get_node_info(&self, node_id: &str) -> Option<Value> {
        self.nodes.lock().unwrap().get(node_id).map(StateEntry::to_value)
    }

    pub fn get_all_states(&self) -> Map<String, Value> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (id.clone(), json!(entry.state.as_str())))
            .collect()
    }

    pub fn get_nodes_by_state(&self, state: NodeState) -> Vec<Value> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.state == state)
            .map(StateEntry::to_value)
            .collect()
    }

    pub fn get_summary(&self) -> Value {
        let nodes = self.nodes.lock().unwrap();
        let mut counts: HashMap<&'static str, u64> = HashMap::new();
        for state in [NodeState::New, NodeState::Stable, NodeState::Intermittent, NodeState::Offline] {
            counts.insert(state.as_str(), 0);
        }
        for entry in nodes.values() {
            *counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }
        json!({
            "tracked_nodes": nodes.len(),
            "states": counts,
            "total_transitions": *self.total_transitions.lock().unwrap(),
        })
    }

    /// Nodes unseen past the offline threshold, with their last-seen time.
    /// Used by the alert engine's offline evaluation.
    pub fn offline_candidates(&self, now: f64) -> Vec<(String, f64)> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|e| now - e.last_seen > self.offline_threshold)
            .map(|e| (e.node_id.clone(), e.last_seen))
            .collect()
    }

    pub fn tracked_node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.lock().unwrap().remove(node_id);
    }

    fn classify(&self, entry: &StateEntry) -> NodeState {
        // Need at least 3 heartbeats to call a node stable or intermittent
        if entry.heartbeats.len() < 3 {
            return NodeState::New;
        }
        if entry.gap_ratio(self.expected_interval) >= self.intermittent_ratio {
            NodeState::Intermittent
        } else {
            NodeState::Stable
        }
    }

    fn fire_callback(&self, node_id: &str, old: NodeState, new: NodeState) {
        let callback = self.on_transition.lock().unwrap().clone();
        if let Some(cb) = callback {
            if catch_unwind(AssertUnwindSafe(|| cb(node_id, old, new))).is_err() {
                debug!("state transition callback panicked for {node_id}");
            }
        }
    }

    fn evict_oldest_locked(nodes: &mut HashMap<String, StateEntry>) {
        let oldest = nodes
            .values()
            .min_by(|a, b| {
                a.last_seen
                    .partial_cmp(&b.last_seen)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|e| e.node_id.clone());
        if let Some(id) = oldest {
            nodes.remove(&id);
        }
    }
}
