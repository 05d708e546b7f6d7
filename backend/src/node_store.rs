//! In-memory store for live MQTT node data.
//!
//! Nodes are keyed by id (`!a1b2c3d4` hex form) and carry position,
//! identity, telemetry, and neighbor links. The store is bounded: inserts
//! past `max_nodes` evict the node with the smallest `last_seen`, and
//! `cleanup_stale_nodes` drops anything unseen past the removal threshold.
//! Downstream trackers are notified of removals through a callback invoked
//! after the store lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::clock::now_secs;
use crate::geojson::{Feature, FeatureCollection};

/// Seconds after `last_seen` at which a node is reported offline.
pub const NODE_STALE_THRESHOLD: f64 = 3600.0;

/// Seconds after `last_seen` at which `cleanup_stale_nodes` deletes a node.
pub const NODE_REMOVE_THRESHOLD: f64 = 86_400.0;

/// Maximum nodes retained in the store.
pub const MAX_STORE_NODES: usize = 10_000;

// ── SNR quality tiers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkQuality {
    Excellent,
    Good,
    Marginal,
    Poor,
    Bad,
    Unknown,
}

impl LinkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Marginal => "marginal",
            Self::Poor => "poor",
            Self::Bad => "bad",
            Self::Unknown => "unknown",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Self::Excellent => "#4caf50",
            Self::Good => "#8bc34a",
            Self::Marginal => "#ffeb3b",
            Self::Poor => "#ff9800",
            Self::Bad => "#f44336",
            Self::Unknown => "#9e9e9e",
        }
    }
}

/// Map a link SNR (dB) onto the five-tier quality scale.
pub fn classify_snr(snr: Option<f64>) -> LinkQuality {
    match snr {
        None => LinkQuality::Unknown,
        Some(v) if v > 8.0 => LinkQuality::Excellent,
        Some(v) if v > 5.0 => LinkQuality::Good,
        Some(v) if v > 0.0 => LinkQuality::Marginal,
        Some(v) if v > -10.0 => LinkQuality::Poor,
        Some(_) => LinkQuality::Bad,
    }
}

// ── Node entry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    pub last_seen: f64,
    pub is_online: bool,
    /// Arbitrary extra telemetry (environment sensors, air quality, health
    /// metrics, ...), stored verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeEntry {
    fn new(id: &str, now: f64) -> Self {
        Self {
            id: id.to_string(),
            latitude: None,
            longitude: None,
            altitude: None,
            name: None,
            short_name: None,
            hardware: None,
            role: None,
            battery: None,
            voltage: None,
            snr: None,
            last_seen: now,
            is_online: false,
            extra: Map::new(),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        matches!(
            (self.latitude, self.longitude),
            (Some(lat), Some(lon))
                if lat.is_finite() && lon.is_finite()
                    && (-90.0..=90.0).contains(&lat)
                    && (-180.0..=180.0).contains(&lon)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
}

/// One topology edge. Coordinate fields are present only when both
/// endpoints have known positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyLink {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    pub quality: LinkQuality,
    pub color: String,
    pub network: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TopologyLink {
    pub fn new(source: &str, target: &str, snr: Option<f64>, network: &str) -> Self {
        let quality = classify_snr(snr);
        Self {
            source: source.to_string(),
            target: target.to_string(),
            source_lat: None,
            source_lon: None,
            target_lat: None,
            target_lon: None,
            snr,
            quality,
            color: quality.color().to_string(),
            network: network.to_string(),
            extra: Map::new(),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.source_lat.is_some()
            && self.source_lon.is_some()
            && self.target_lat.is_some()
            && self.target_lon.is_some()
    }

    /// LineString feature for links with resolved endpoints.
    pub fn to_feature(&self) -> Option<Feature> {
        if !self.has_coordinates() {
            return None;
        }
        let coords = vec![
            vec![self.source_lon?, self.source_lat?],
            vec![self.target_lon?, self.target_lat?],
        ];
        let mut props = Map::new();
        props.insert("source".into(), json!(self.source));
        props.insert("target".into(), json!(self.target));
        if let Some(snr) = self.snr {
            props.insert("snr".into(), json!(snr));
        }
        props.insert("quality".into(), json!(self.quality.as_str()));
        props.insert("color".into(), json!(self.color));
        props.insert("network".into(), json!(self.network));
        for (k, v) in &self.extra {
            props.insert(k.clone(), v.clone());
        }
        Some(Feature::line_string(coords, props))
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

type RemovalCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct StoreInner {
    nodes: HashMap<String, NodeEntry>,
    neighbors: HashMap<String, Vec<Neighbor>>,
}

pub struct MqttNodeStore {
    inner: Mutex<StoreInner>,
    stale_seconds: f64,
    remove_seconds: f64,
    max_nodes: usize,
    on_removed: Mutex<Option<RemovalCallback>>,
}

impl Default for MqttNodeStore {
    fn default() -> Self {
        Self::new(NODE_STALE_THRESHOLD, NODE_REMOVE_THRESHOLD, MAX_STORE_NODES)
    }
}

impl MqttNodeStore {
    pub fn new(stale_seconds: f64, remove_seconds: f64, max_nodes: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                nodes: HashMap::new(),
                neighbors: HashMap::new(),
            }),
            stale_seconds,
            remove_seconds,
            max_nodes,
            on_removed: Mutex::new(None),
        }
    }

    /// Register the single removal listener. The orchestrator fans this out
    /// to the connectivity tracker, drift detector, and health scorer.
    pub fn set_removal_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_removed.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn update_position(
        &self,
        node_id: &str,
        lat: f64,
        lon: f64,
        altitude: Option<f64>,
        timestamp: Option<f64>,
    ) {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            let evicted = self.make_room(&mut inner, node_id);
            let now = timestamp.unwrap_or_else(now_secs);
            let node = inner
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeEntry::new(node_id, now));
            node.latitude = Some(lat);
            node.longitude = Some(lon);
            if altitude.is_some() {
                node.altitude = altitude;
            }
            node.last_seen = now;
            node.is_online = true;
            evicted
        };
        self.notify_removed(evicted);
    }

    pub fn update_nodeinfo(
        &self,
        node_id: &str,
        long_name: Option<&str>,
        short_name: Option<&str>,
        hardware: Option<&str>,
        role: Option<&str>,
    ) {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            let evicted = self.make_room(&mut inner, node_id);
            let now = now_secs();
            let node = inner
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeEntry::new(node_id, now));
            if let Some(v) = long_name.filter(|v| !v.is_empty()) {
                node.name = Some(v.to_string());
            }
            if let Some(v) = short_name.filter(|v| !v.is_empty()) {
                node.short_name = Some(v.to_string());
            }
            if let Some(v) = hardware.filter(|v| !v.is_empty()) {
                node.hardware = Some(v.to_string());
            }
            if let Some(v) = role.filter(|v| !v.is_empty()) {
                node.role = Some(v.to_string());
            }
            node.last_seen = now;
            evicted
        };
        self.notify_removed(evicted);
    }

    /// Merge telemetry into the node entry. Known metrics land in the typed
    /// fields; every other non-null key is stored verbatim.
    pub fn update_telemetry(&self, node_id: &str, fields: Map<String, Value>) {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            let evicted = self.make_room(&mut inner, node_id);
            let now = now_secs();
            let node = inner
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeEntry::new(node_id, now));
            for (key, value) in fields {
                if value.is_null() {
                    continue;
                }
                match key.as_str() {
                    "battery" => node.battery = value.as_f64(),
                    "voltage" => node.voltage = value.as_f64(),
                    "snr" => node.snr = value.as_f64(),
                    _ => {
                        node.extra.insert(key, value);
                    }
                }
            }
            node.last_seen = now;
            evicted
        };
        self.notify_removed(evicted);
    }

    pub fn update_neighbors(&self, node_id: &str, neighbors: Vec<Neighbor>) {
        let mut inner = self.inner.lock().unwrap();
        inner.neighbors.insert(node_id.to_string(), neighbors);
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeEntry> {
        self.inner.lock().unwrap().nodes.get(node_id).cloned()
    }

    /// All nodes with valid coordinates, as copies. `is_online` reflects
    /// staleness against the store threshold at call time.
    pub fn get_all_nodes(&self) -> Vec<NodeEntry> {
        let now = now_secs();
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .filter(|node| node.has_coordinates())
            .map(|node| {
                let mut copy = node.clone();
                copy.is_online = (now - copy.last_seen) <= self.stale_seconds;
                copy
            })
            .collect()
    }

    /// Neighbor links. Coordinates are attached only when both endpoints
    /// are known; unresolved links are still reported.
    pub fn get_topology_links(&self) -> Vec<TopologyLink> {
        let inner = self.inner.lock().unwrap();
        let mut links = Vec::new();
        for (node_id, neighbors) in &inner.neighbors {
            for neighbor in neighbors {
                let mut link =
                    TopologyLink::new(node_id, &neighbor.node_id, neighbor.snr, "meshtastic");
                let source = inner.nodes.get(node_id).filter(|n| n.has_coordinates());
                let target = inner
                    .nodes
                    .get(&neighbor.node_id)
                    .filter(|n| n.has_coordinates());
                if let (Some(source), Some(target)) = (source, target) {
                    link.source_lat = source.latitude;
                    link.source_lon = source.longitude;
                    link.target_lat = target.latitude;
                    link.target_lon = target.longitude;
                }
                links.push(link);
            }
        }
        links
    }

    /// Topology as a LineString FeatureCollection, one feature per link
    /// with resolved endpoints, colored by SNR tier.
    pub fn get_topology_geojson(&self) -> FeatureCollection {
        let features: Vec<Feature> = self
            .get_topology_links()
            .iter()
            .filter_map(TopologyLink::to_feature)
            .collect();
        let mut fc = FeatureCollection::new(features, "meshtastic");
        let count = fc.features.len();
        fc.properties.insert("link_count".into(), json!(count));
        fc
    }

    /// Delete nodes unseen past the removal threshold, with their neighbor
    /// records. Returns the removed ids.
    pub fn cleanup_stale_nodes(&self) -> Vec<String> {
        let now = now_secs();
        let removed: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            let stale: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, node)| now - node.last_seen > self.remove_seconds)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                inner.nodes.remove(id);
                inner.neighbors.remove(id);
            }
            stale
        };
        if !removed.is_empty() {
            debug!("removed {} stale nodes from MQTT store", removed.len());
        }
        for id in &removed {
            self.notify_removed(Some(id.clone()));
        }
        removed
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Evict the oldest node when at capacity and `node_id` is new.
    /// Must hold the lock; returns the evicted id for post-lock callbacks.
    fn make_room(&self, inner: &mut StoreInner, node_id: &str) -> Option<String> {
        if inner.nodes.contains_key(node_id) || inner.nodes.len() < self.max_nodes {
            return None;
        }
        let oldest = inner
            .nodes
            .values()
            .min_by(|a, b| {
                a.last_seen
                    .partial_cmp(&b.last_seen)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|n| n.id.clone())?;
        inner.nodes.remove(&oldest);
        inner.neighbors.remove(&oldest);
        debug!("evicted node {oldest} from MQTT store (capacity limit)");
        Some(oldest)
    }

    fn notify_removed(&self, node_id: Option<String>) {
        if let Some(id) = node_id {
            let callback = self.on_removed.lock().unwrap().clone();
            if let Some(cb) = callback {
                cb(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn snr_tiers() {
        assert_eq!(classify_snr(Some(9.5)), LinkQuality::Excellent);
        assert_eq!(classify_snr(Some(6.0)), LinkQuality::Good);
        assert_eq!(classify_snr(Some(2.0)), LinkQuality::Marginal);
        assert_eq!(classify_snr(Some(-5.0)), LinkQuality::Poor);
        assert_eq!(classify_snr(Some(-10.0)), LinkQuality::Bad);
        assert_eq!(classify_snr(None), LinkQuality::Unknown);
        assert_eq!(LinkQuality::Excellent.color(), "#4caf50");
    }

    #[test]
    fn nodes_without_coordinates_not_returned() {
        let store = MqttNodeStore::default();
        store.update_nodeinfo("!a1", Some("Alpha"), None, None, None);
        assert!(store.get_all_nodes().is_empty());
        store.update_position("!a1", 40.0, -105.0, None, None);
        let nodes = store.get_all_nodes();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_online);
        assert_eq!(nodes[0].name.as_deref(), Some("Alpha"));
    }

    #[test]
    fn stale_nodes_marked_offline() {
        let store = MqttNodeStore::new(3600.0, 86_400.0, 100);
        store.update_position("!a1", 40.0, -105.0, None, Some(now_secs() - 7200.0));
        let nodes = store.get_all_nodes();
        assert_eq!(nodes.len(), 1);
        assert!(!nodes[0].is_online);
    }

    #[test]
    fn telemetry_extra_keys_stored_verbatim() {
        let store = MqttNodeStore::default();
        let mut fields = Map::new();
        fields.insert("battery".into(), json!(77));
        fields.insert("iaq".into(), json!(51));
        fields.insert("bogus".into(), Value::Null);
        store.update_telemetry("!a1", fields);
        let node = store.get_node("!a1").unwrap();
        assert_eq!(node.battery, Some(77.0));
        assert_eq!(node.extra.get("iaq"), Some(&json!(51)));
        assert!(!node.extra.contains_key("bogus"));
    }

    #[test]
    fn topology_geojson_matches_snr_tier() {
        let store = MqttNodeStore::default();
        store.update_position("!a", 40.0, -105.0, None, None);
        store.update_position("!b", 40.1, -105.1, None, None);
        store.update_neighbors(
            "!a",
            vec![Neighbor {
                node_id: "!b".into(),
                snr: Some(9.5),
            }],
        );

        let fc = store.get_topology_geojson();
        assert_eq!(fc.features.len(), 1);
        assert_eq!(fc.properties["link_count"], json!(1));
        let feature = &fc.features[0];
        assert_eq!(feature.geometry["type"], json!("LineString"));
        assert_eq!(
            feature.geometry["coordinates"],
            json!([[-105.0, 40.0], [-105.1, 40.1]])
        );
        assert_eq!(feature.properties["quality"], json!("excellent"));
        assert_eq!(feature.properties["color"], json!("#4caf50"));
    }

    #[test]
    fn unresolved_links_reported_without_coordinates() {
        let store = MqttNodeStore::default();
        store.update_position("!a", 40.0, -105.0, None, None);
        store.update_neighbors(
            "!a",
            vec![Neighbor {
                node_id: "!missing".into(),
                snr: None,
            }],
        );
        let links = store.get_topology_links();
        assert_eq!(links.len(), 1);
        assert!(!links[0].has_coordinates());
        // No feature emitted for the unresolved link
        assert!(store.get_topology_geojson().features.is_empty());
    }

    #[test]
    fn eviction_removes_oldest_and_notifies() {
        let store = MqttNodeStore::new(3600.0, 86_400.0, 2);
        let removed = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&removed);
        store.set_removal_callback(move |id| {
            assert_eq!(id, "!old");
            r.fetch_add(1, Ordering::SeqCst);
        });

        let now = now_secs();
        store.update_position("!old", 1.0, 1.0, None, Some(now - 500.0));
        store.update_position("!mid", 2.0, 2.0, None, Some(now - 100.0));
        store.update_position("!new", 3.0, 3.0, None, Some(now));

        assert_eq!(store.node_count(), 2);
        assert!(store.get_node("!old").is_none());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_removes_old_nodes_and_neighbors() {
        let store = MqttNodeStore::new(3600.0, 1000.0, 100);
        let now = now_secs();
        store.update_position("!gone", 1.0, 1.0, None, Some(now - 2000.0));
        store.update_position("!kept", 2.0, 2.0, None, Some(now));
        store.update_neighbors(
            "!gone",
            vec![Neighbor {
                node_id: "!kept".into(),
                snr: None,
            }],
        );

        let removed = store.cleanup_stale_nodes();
        assert_eq!(removed, vec!["!gone".to_string()]);
        assert_eq!(store.node_count(), 1);
        assert!(store.get_topology_links().is_empty());
    }
}
