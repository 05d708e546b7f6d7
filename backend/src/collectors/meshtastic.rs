//! Meshtastic collector.
//!
//! Merges three sources in priority order, deduplicating by node id:
//!   1. Local meshtasticd HTTP API (exclusive TCP endpoint, behind the
//!      connection gate)
//!   2. Live MQTT subscriber store
//!   3. On-disk MQTT node cache
//!
//! All three are optional at runtime; whatever subset responds contributes
//! features, so a missing daemon never fails the cycle.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::now_secs;
use crate::connection_gate::ConnectionGate;
use crate::geojson::{insert_opt, node_feature, validate_coordinates, Feature, FeatureCollection};
use crate::node_store::{MqttNodeStore, NodeEntry};

use super::{Collector, FetchError, USER_AGENT};

/// Seconds since `lastHeard` under which a daemon-reported node counts as
/// online.
const ONLINE_THRESHOLD: f64 = 900.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Auto,
    MqttOnly,
    LocalOnly,
}

impl SourceMode {
    pub fn from_str(mode: &str) -> Self {
        match mode {
            "mqtt_only" => Self::MqttOnly,
            "local_only" => Self::LocalOnly,
            _ => Self::Auto,
        }
    }
}

pub struct MeshtasticCollector {
    client: reqwest::Client,
    api_base: String,
    gate: Arc<ConnectionGate>,
    connection_timeout: f64,
    mqtt_store: Option<Arc<MqttNodeStore>>,
    mqtt_cache_path: PathBuf,
    source_mode: SourceMode,
}

impl MeshtasticCollector {
    pub fn new(
        host: &str,
        port: u16,
        gate: Arc<ConnectionGate>,
        mqtt_store: Option<Arc<MqttNodeStore>>,
        mqtt_cache_path: PathBuf,
        source_mode: SourceMode,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            api_base: format!("http://{host}:{port}"),
            gate,
            connection_timeout: 5.0,
            mqtt_store,
            mqtt_cache_path,
            source_mode,
        }
    }

    /// Local daemon query. The gate serializes access with any co-resident
    /// gateway talking to the same meshtasticd instance.
    async fn fetch_from_api(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        let handle = self
            .gate
            .acquire(self.connection_timeout, "maps_collector")
            .await;
        if !handle.acquired() {
            debug!(
                "meshtasticd connection held by '{}', skipping API fetch",
                self.gate.holder().unwrap_or_default()
            );
            return features;
        }

        let url = format!("{}/api/v1/nodes", self.api_base);
        let data: Value = match self.client.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json().await {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("meshtasticd API returned bad JSON: {e}");
                        return features;
                    }
                },
                Err(e) => {
                    debug!("meshtasticd API error status: {e}");
                    return features;
                }
            },
            Err(e) => {
                debug!("meshtasticd API unavailable: {e}");
                return features;
            }
        };

        let nodes = match &data {
            Value::Array(list) => list.clone(),
            Value::Object(obj) => obj
                .get("nodes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        for node in &nodes {
            if let Some(feature) = parse_api_node(node) {
                features.push(feature);
            }
        }
        debug!("meshtasticd API returned {} nodes", features.len());
        features
    }

    fn fetch_from_live_mqtt(&self) -> Vec<Feature> {
        let Some(store) = &self.mqtt_store else {
            return Vec::new();
        };
        store.get_all_nodes().iter().map(entry_to_feature).collect()
    }

    async fn fetch_from_mqtt_cache(&self) -> Vec<Feature> {
        let raw = match tokio::fs::read(&self.mqtt_cache_path).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let data: Value = match serde_json::from_slice(&raw) {
            Ok(data) => data,
            Err(e) => {
                debug!("MQTT cache read failed: {e}");
                return Vec::new();
            }
        };

        let mut features = Vec::new();
        if data.get("type").and_then(Value::as_str) == Some("FeatureCollection") {
            if let Some(list) = data.get("features").and_then(Value::as_array) {
                for item in list {
                    let network = item
                        .pointer("/properties/network")
                        .and_then(Value::as_str);
                    if network == Some("meshtastic") {
                        if let Ok(feature) = serde_json::from_value::<Feature>(item.clone()) {
                            features.push(feature);
                        }
                    }
                }
            }
        } else if let Value::Object(nodes) = &data {
            for (node_id, node) in nodes {
                if let Some(feature) = parse_cached_node(node_id, node) {
                    features.push(feature);
                }
            }
        }
        debug!("MQTT cache returned {} meshtastic nodes", features.len());
        features
    }
}

#[async_trait]
impl Collector for MeshtasticCollector {
    fn source_name(&self) -> &'static str {
        "meshtastic"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut features: Vec<Feature> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut add_all = |batch: Vec<Feature>, features: &mut Vec<Feature>| {
            for feature in batch {
                if let Some(id) = feature.id() {
                    if seen.insert(id.to_string()) {
                        features.push(feature);
                    }
                }
            }
        };

        if self.source_mode != SourceMode::MqttOnly {
            add_all(self.fetch_from_api().await, &mut features);
        }
        if self.source_mode != SourceMode::LocalOnly {
            add_all(self.fetch_from_live_mqtt(), &mut features);
            add_all(self.fetch_from_mqtt_cache().await, &mut features);
        }

        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

/// Parse one node from the meshtasticd API. Coordinates may be float
/// degrees or the firmware's 1e7-scaled integers.
fn parse_api_node(node: &Value) -> Option<Feature> {
    let position = node.get("position").cloned().unwrap_or(Value::Null);
    let lat = position
        .get("latitude")
        .or_else(|| position.get("latitudeI"))
        .and_then(Value::as_f64);
    let lon = position
        .get("longitude")
        .or_else(|| position.get("longitudeI"))
        .and_then(Value::as_f64);
    let (lat, lon) = validate_coordinates(lat, lon, true)?;

    let user = node.get("user").cloned().unwrap_or(Value::Null);
    let node_id = user
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| node.get("num").and_then(Value::as_u64).map(mesh_wire::format_node_id))?;
    let name = user
        .get("longName")
        .or_else(|| user.get("shortName"))
        .and_then(Value::as_str)
        .unwrap_or(&node_id)
        .to_string();
    let role = user.get("role").and_then(Value::as_str).unwrap_or("");

    let metrics = node.get("deviceMetrics").cloned().unwrap_or(Value::Null);
    let last_heard = node.get("lastHeard").and_then(Value::as_f64);
    let hops_away = node.get("hopsAway").and_then(Value::as_i64);
    let is_online = last_heard.map(|heard| now_secs() - heard < ONLINE_THRESHOLD);
    let is_relay = matches!(role, "ROUTER" | "ROUTER_CLIENT" | "REPEATER");

    let mut extra = Map::new();
    insert_opt(&mut extra, "hardware", user.get("hwModel").and_then(Value::as_str));
    if !role.is_empty() {
        extra.insert("role".into(), Value::String(role.to_string()));
        extra.insert("is_gateway".into(), Value::Bool(matches!(role, "ROUTER" | "ROUTER_CLIENT")));
        extra.insert("is_relay".into(), Value::Bool(is_relay));
    }
    insert_opt(&mut extra, "battery", metrics.get("batteryLevel").and_then(Value::as_f64));
    insert_opt(&mut extra, "voltage", metrics.get("voltage").and_then(Value::as_f64));
    insert_opt(&mut extra, "channel_util", metrics.get("channelUtilization").and_then(Value::as_f64));
    insert_opt(&mut extra, "air_util_tx", metrics.get("airUtilTx").and_then(Value::as_f64));
    insert_opt(&mut extra, "snr", node.get("snr").and_then(Value::as_f64));
    insert_opt(&mut extra, "is_online", is_online);
    insert_opt(&mut extra, "is_local", hops_away.map(|h| h == 0));
    insert_opt(&mut extra, "hops_away", hops_away);
    insert_opt(&mut extra, "via_mqtt", node.get("viaMqtt").and_then(Value::as_bool));
    insert_opt(&mut extra, "last_seen", last_heard);
    insert_opt(&mut extra, "altitude", position.get("altitude").and_then(Value::as_f64));

    Some(node_feature(&node_id, lat, lon, "meshtastic", &name, "meshtastic_node", extra))
}

/// Convert a live store entry into the standard node feature.
fn entry_to_feature(entry: &NodeEntry) -> Feature {
    let mut extra = Map::new();
    insert_opt(&mut extra, "short_name", entry.short_name.clone());
    insert_opt(&mut extra, "hardware", entry.hardware.clone());
    insert_opt(&mut extra, "role", entry.role.clone());
    insert_opt(&mut extra, "battery", entry.battery);
    insert_opt(&mut extra, "voltage", entry.voltage);
    insert_opt(&mut extra, "snr", entry.snr);
    insert_opt(&mut extra, "altitude", entry.altitude);
    extra.insert("is_online".into(), Value::Bool(entry.is_online));
    extra.insert("last_seen".into(), serde_json::json!(entry.last_seen));
    for (k, v) in &entry.extra {
        extra.insert(k.clone(), v.clone());
    }
    node_feature(
        &entry.id,
        entry.latitude.unwrap_or_default(),
        entry.longitude.unwrap_or_default(),
        "meshtastic",
        entry.name.as_deref().unwrap_or(&entry.id),
        "meshtastic_node",
        extra,
    )
}

/// Parse one entry from the on-disk MQTT cache (node-map form).
fn parse_cached_node(node_id: &str, node: &Value) -> Option<Feature> {
    let (lat, lon) = validate_coordinates(
        node.get("latitude").and_then(Value::as_f64),
        node.get("longitude").and_then(Value::as_f64),
        false,
    )?;
    let name = node
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(node_id)
        .to_string();

    let mut extra = Map::new();
    for key in [
        "hardware", "role", "battery", "voltage", "snr", "is_online", "last_seen",
        "temperature", "humidity", "pressure", "channel_util", "air_util_tx", "altitude",
        "iaq", "pm25_standard", "pm100_standard", "co2", "heart_bpm", "spo2",
    ] {
        if let Some(v) = node.get(key) {
            if !v.is_null() {
                extra.insert(key.to_string(), v.clone());
            }
        }
    }
    Some(node_feature(node_id, lat, lon, "meshtastic", &name, "meshtastic_node", extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_node_with_scaled_integer_coordinates() {
        let node = json!({
            "num": 0xa1b2c3d4u64,
            "position": {"latitudeI": 400_000_000i64, "longitudeI": -1_050_000_000i64, "altitude": 1600},
            "user": {"id": "!a1b2c3d4", "longName": "Lookout", "hwModel": "TBEAM", "role": "ROUTER"},
            "deviceMetrics": {"batteryLevel": 80, "voltage": 4.01},
            "snr": 6.5,
            "lastHeard": now_secs() - 60.0,
            "hopsAway": 0,
        });
        let feature = parse_api_node(&node).unwrap();
        let coords = feature.geometry["coordinates"].as_array().unwrap();
        assert!((coords[0].as_f64().unwrap() + 105.0).abs() < 1e-9);
        assert_eq!(feature.properties["id"], json!("!a1b2c3d4"));
        assert_eq!(feature.properties["is_online"], json!(true));
        assert_eq!(feature.properties["is_local"], json!(true));
        assert_eq!(feature.properties["is_gateway"], json!(true));
    }

    #[test]
    fn api_node_offline_past_threshold() {
        let node = json!({
            "user": {"id": "!05060708"},
            "position": {"latitude": 39.5, "longitude": -104.9},
            "lastHeard": now_secs() - 1200.0,
        });
        let feature = parse_api_node(&node).unwrap();
        assert_eq!(feature.properties["is_online"], json!(false));
    }

    #[test]
    fn api_node_without_position_dropped() {
        let node = json!({"user": {"id": "!0a0b0c0d"}});
        assert!(parse_api_node(&node).is_none());
    }

    #[test]
    fn cached_node_parsed_with_extras() {
        let node = json!({
            "latitude": 40.0, "longitude": -105.0,
            "name": "Cache Node", "battery": 55, "co2": 420,
        });
        let feature = parse_cached_node("!deadbeef", &node).unwrap();
        assert_eq!(feature.properties["name"], json!("Cache Node"));
        assert_eq!(feature.properties["co2"], json!(420));
        assert_eq!(feature.properties["network"], json!("meshtastic"));
    }
}
