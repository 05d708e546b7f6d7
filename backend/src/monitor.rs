//! Node monitoring pipeline.
//!
//! Owns the stateful analytics components and wires them to the two data
//! paths: live MQTT events arriving on the bus (heartbeats, drift checks)
//! and aggregated collection output (health scoring, alert evaluation,
//! history recording). The maintenance pass runs offline scans and history
//! pruning; the store's node-removal callback fans out from here so the
//! stores never reference each other.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::alert_engine::AlertEngine;
use crate::config_drift::ConfigDriftDetector;
use crate::event_bus::{Event, EventBus, EventType};
use crate::geojson::FeatureCollection;
use crate::health_score::NodeHealthScorer;
use crate::node_history::{NodeHistoryStore, Observation};
use crate::node_state::NodeStateTracker;

pub struct NodeMonitor {
    pub state_tracker: Arc<NodeStateTracker>,
    pub health_scorer: Arc<NodeHealthScorer>,
    pub drift_detector: Arc<ConfigDriftDetector>,
    pub alert_engine: Arc<AlertEngine>,
    pub history: Arc<NodeHistoryStore>,
}

impl NodeMonitor {
    pub fn new(bus: Arc<EventBus>, history: Arc<NodeHistoryStore>) -> Arc<Self> {
        let monitor = Arc::new(Self {
            state_tracker: Arc::new(NodeStateTracker::default()),
            health_scorer: Arc::new(NodeHealthScorer::default()),
            drift_detector: Arc::new(ConfigDriftDetector::default()),
            alert_engine: Arc::new(AlertEngine::new(
                None,
                crate::alert_engine::MAX_ALERT_HISTORY,
                Some(Arc::clone(&bus)),
            )),
            history,
        });
        monitor.wire_bus(&bus);
        monitor
    }

    /// Live MQTT events drive the heartbeat stream and config-drift checks.
    fn wire_bus(self: &Arc<Self>, bus: &EventBus) {
        for event_type in [
            EventType::NodePosition,
            EventType::NodeInfo,
            EventType::NodeTelemetry,
        ] {
            let monitor = Arc::clone(self);
            bus.subscribe(Some(event_type), move |event| {
                monitor.on_node_event(event);
            });
        }
    }

    fn on_node_event(&self, event: &Event) {
        let Some(node) = &event.node else {
            return;
        };
        self.state_tracker
            .record_heartbeat(&node.node_id, Some(event.timestamp));
        if event.event_type == EventType::NodeInfo {
            self.drift_detector.check_node(&node.node_id, &event.data);
        }
    }

    /// Score, alert on, and record every node feature of an aggregated
    /// collection. Non-point features (weather alert polygons) are skipped.
    pub fn ingest_collection(&self, fc: &FeatureCollection) {
        let mut scored = 0usize;
        for feature in &fc.features {
            let Some(node_id) = feature.id().map(str::to_string) else {
                continue;
            };
            let coords = match feature.geometry.get("type").and_then(Value::as_str) {
                Some("Point") => feature
                    .geometry
                    .get("coordinates")
                    .and_then(Value::as_array)
                    .cloned(),
                _ => continue,
            };

            let props = &feature.properties;
            self.drift_detector.check_node(&node_id, props);

            let connectivity = self
                .state_tracker
                .get_node_state(&node_id)
                .map(|s| s.as_str());
            let score = self
                .health_scorer
                .score_node(&node_id, props, connectivity, None);
            self.alert_engine
                .evaluate_node(&node_id, props, Some(score.score), None);
            scored += 1;

            if let Some(coords) = coords {
                let (Some(lon), Some(lat)) = (
                    coords.first().and_then(Value::as_f64),
                    coords.get(1).and_then(Value::as_f64),
                ) else {
                    continue;
                };
                self.history.record_observation(&Observation {
                    node_id: node_id.clone(),
                    timestamp: None,
                    latitude: lat,
                    longitude: lon,
                    altitude: coords.get(2).and_then(Value::as_f64).or_else(|| {
                        props.get("altitude").and_then(Value::as_f64)
                    }),
                    network: props
                        .get("network")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    snr: props.get("snr").and_then(Value::as_f64),
                    battery: props.get("battery").and_then(Value::as_i64),
                    name: props
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        debug!("monitor ingested {scored} node features");
    }

    /// Periodic pass: offline transitions, offline alerts, history pruning.
    pub fn run_maintenance(&self) {
        let transitioned = self.state_tracker.check_offline(None);
        if !transitioned.is_empty() {
            info!("{} nodes transitioned to offline", transitioned.len());
        }
        let now = crate::clock::now_secs();
        let threshold = self.state_tracker.offline_threshold();
        for (node_id, last_seen) in self.state_tracker.offline_candidates(now) {
            self.alert_engine
                .evaluate_offline(&node_id, last_seen, threshold, Some(now));
        }
        self.history.prune_old_data(None);
    }

    /// Node-removal fan-out from the MQTT store.
    pub fn handle_node_removed(&self, node_id: &str) {
        self.state_tracker.remove_node(node_id);
        self.health_scorer.remove_node(node_id);
        self.drift_detector.remove_node(node_id);
    }
}
