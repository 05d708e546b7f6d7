//! Thread-safe publish-subscribe event bus for decoupled component
//! communication.
//!
//! Events flow from producers (the MQTT subscriber, the aggregator, the
//! alert engine) through the bus to consumers (WebSocket broadcast, state
//! tracking). Delivery is synchronous in the publisher's thread; each
//! subscriber runs inside its own panic boundary so one bad handler never
//! blocks the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::error;

use crate::clock::now_secs;

// ── Event types ───────────────────────────────────────────────────────────────

/// Event categories for subscription filtering. The wire strings are frozen
/// (`node.position`, `service.up`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NodePosition,
    NodeInfo,
    NodeTelemetry,
    NodeTopology,
    ServiceUp,
    ServiceDown,
    ServiceDegraded,
    DataRefreshed,
    AlertFired,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodePosition => "node.position",
            Self::NodeInfo => "node.info",
            Self::NodeTelemetry => "node.telemetry",
            Self::NodeTopology => "node.topology",
            Self::ServiceUp => "service.up",
            Self::ServiceDown => "service.down",
            Self::ServiceDegraded => "service.degraded",
            Self::DataRefreshed => "data.refreshed",
            Self::AlertFired => "alert.fired",
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Node position/info/telemetry events carry the node id and, when known,
/// its coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_id: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: f64,
    pub source: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl Event {
    fn new(event_type: EventType, source: &str, data: Map<String, Value>) -> Self {
        Self {
            event_type,
            timestamp: now_secs(),
            source: source.to_string(),
            data,
            node: None,
            service_name: None,
        }
    }

    fn node(mut self, node_id: &str, lat: Option<f64>, lon: Option<f64>) -> Self {
        self.node = Some(NodeRef {
            node_id: node_id.to_string(),
            lat,
            lon,
        });
        self
    }

    pub fn position(node_id: &str, lat: f64, lon: f64, source: &str, data: Map<String, Value>) -> Self {
        Self::new(EventType::NodePosition, source, data).node(node_id, Some(lat), Some(lon))
    }

    pub fn info(node_id: &str, source: &str, data: Map<String, Value>) -> Self {
        Self::new(EventType::NodeInfo, source, data).node(node_id, None, None)
    }

    pub fn telemetry(node_id: &str, source: &str, data: Map<String, Value>) -> Self {
        Self::new(EventType::NodeTelemetry, source, data).node(node_id, None, None)
    }

    pub fn topology(node_id: &str, source: &str, data: Map<String, Value>) -> Self {
        Self::new(EventType::NodeTopology, source, data).node(node_id, None, None)
    }

    pub fn service_up(service_name: &str) -> Self {
        let mut ev = Self::new(EventType::ServiceUp, service_name, Map::new());
        ev.service_name = Some(service_name.to_string());
        ev
    }

    pub fn service_down(service_name: &str, reason: &str) -> Self {
        let mut data = Map::new();
        data.insert("reason".into(), Value::String(reason.to_string()));
        let mut ev = Self::new(EventType::ServiceDown, service_name, data);
        ev.service_name = Some(service_name.to_string());
        ev
    }

    pub fn service_degraded(service_name: &str, reason: &str) -> Self {
        let mut data = Map::new();
        data.insert("reason".into(), Value::String(reason.to_string()));
        let mut ev = Self::new(EventType::ServiceDegraded, service_name, data);
        ev.service_name = Some(service_name.to_string());
        ev
    }

    pub fn data_refreshed(source: &str, data: Map<String, Value>) -> Self {
        Self::new(EventType::DataRefreshed, source, data)
    }

    pub fn alert_fired(alert: Map<String, Value>) -> Self {
        Self::new(EventType::AlertFired, "alert_engine", alert)
    }

    /// Serialize into the WebSocket wire format:
    /// `{type, timestamp, source, [node_id, lat, lon], data}`.
    pub fn to_wire(&self) -> Value {
        let mut msg = Map::new();
        msg.insert("type".into(), json!(self.event_type.as_str()));
        msg.insert("timestamp".into(), json!(self.timestamp));
        msg.insert("source".into(), json!(self.source));
        if let Some(node) = &self.node {
            msg.insert("node_id".into(), json!(node.node_id));
            if let Some(lat) = node.lat {
                msg.insert("lat".into(), json!(lat));
            }
            if let Some(lon) = node.lon {
                msg.insert("lon".into(), json!(lon));
            }
        }
        if let Some(service) = &self.service_name {
            msg.insert("service_name".into(), json!(service));
        }
        if !self.data.is_empty() {
            msg.insert("data".into(), Value::Object(self.data.clone()));
        }
        Value::Object(msg)
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used for unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct Registry {
    // None key = wildcard subscribers receiving every event
    subscribers: HashMap<Option<EventType>, Vec<(u64, Subscriber)>>,
}

pub struct EventBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
    total_errors: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Register a callback for one event type, or `None` for all events.
    pub fn subscribe<F>(&self, event_type: Option<EventType>, callback: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock().unwrap();
        registry
            .subscribers
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(callback)));
        SubscriberId(id)
    }

    /// Remove a previously registered callback. Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut registry = self.registry.lock().unwrap();
        for subs in registry.subscribers.values_mut() {
            subs.retain(|(sid, _)| *sid != id.0);
        }
        registry.subscribers.retain(|_, subs| !subs.is_empty());
    }

    /// Publish an event to all matching subscribers (specific type plus
    /// wildcard). The subscriber list is snapshotted before delivery so a
    /// callback may subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event: &Event) {
        let targets: Vec<Subscriber> = {
            let registry = self.registry.lock().unwrap();
            let mut targets = Vec::new();
            if let Some(specific) = registry.subscribers.get(&Some(event.event_type)) {
                targets.extend(specific.iter().map(|(_, cb)| Arc::clone(cb)));
            }
            if let Some(wildcard) = registry.subscribers.get(&None) {
                targets.extend(wildcard.iter().map(|(_, cb)| Arc::clone(cb)));
            }
            targets
        };

        self.total_published.fetch_add(1, Ordering::Relaxed);

        for callback in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => {
                    self.total_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.total_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "event bus subscriber panicked on {}",
                        event.event_type.as_str()
                    );
                }
            }
        }
    }

    /// Count subscribers for a specific event type, or every subscriber
    /// when `None`.
    pub fn subscriber_count(&self, event_type: Option<EventType>) -> usize {
        let registry = self.registry.lock().unwrap();
        match event_type {
            Some(t) => registry.subscribers.get(&Some(t)).map_or(0, Vec::len),
            None => registry.subscribers.values().map(Vec::len).sum(),
        }
    }

    pub fn stats(&self) -> Map<String, Value> {
        let mut stats = Map::new();
        stats.insert(
            "total_published".into(),
            json!(self.total_published.load(Ordering::Relaxed)),
        );
        stats.insert(
            "total_delivered".into(),
            json!(self.total_delivered.load(Ordering::Relaxed)),
        );
        stats.insert(
            "total_errors".into(),
            json!(self.total_errors.load(Ordering::Relaxed)),
        );
        stats
    }

    /// Remove all subscribers and reset counters.
    pub fn reset(&self) {
        self.registry.lock().unwrap().subscribers.clear();
        self.total_published.store(0, Ordering::Relaxed);
        self.total_delivered.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
    }
}
