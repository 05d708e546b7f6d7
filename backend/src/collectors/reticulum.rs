//! Reticulum collector.
//!
//! Aggregates up to four sources, deduplicating by destination identity:
//!   1. Local RNS status (`rnstatus -d --json` subprocess)
//!   2. Reticulum Community Hub REST API
//!   3. On-disk RNS node cache
//!   4. Unified node cache (reticulum entries)
//!
//! Reticulum nodes are identified by cryptographic destination hashes;
//! the collector treats ids as opaque strings.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::geojson::{insert_opt, node_feature, validate_coordinates, Feature, FeatureCollection};

use super::{Collector, FetchError, USER_AGENT};

const RNSTATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// RNS interface type → display label.
fn display_node_type(kind: &str) -> &str {
    match kind {
        "rnode" => "RNode (LoRa)",
        "nomadnet" => "NomadNet",
        "rnsd" => "RNSD",
        "tcp" => "TCP Transport",
        "i2p" => "I2P",
        "tnc" => "TNC KiSS",
        "retibbs" => "RetiBBS",
        "lxmf_group" => "LXMF Group",
        "lxmf_peer" => "LXMF Peer",
        "multi" => "Multi-Interface",
        "yggdrasil" => "Yggdrasil",
        other => other,
    }
}

pub struct ReticulumCollector {
    client: reqwest::Client,
    hub_base: String,
    hub_api_key: Option<String>,
    cache_paths: Vec<PathBuf>,
}

impl ReticulumCollector {
    pub fn new(hub_host: &str, hub_port: u16, hub_api_key: Option<String>, cache_paths: Vec<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            hub_base: format!("http://{hub_host}:{hub_port}"),
            hub_api_key,
            cache_paths,
        }
    }

    /// Query the local Reticulum instance via rnstatus.
    async fn fetch_from_rnstatus(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        let output = tokio::time::timeout(
            RNSTATUS_TIMEOUT,
            tokio::process::Command::new("rnstatus")
                .args(["-d", "--json"])
                .output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) => {
                debug!("rnstatus not available or failed");
                return features;
            }
            Ok(Err(e)) => {
                debug!("rnstatus failed to spawn: {e}");
                return features;
            }
            Err(_) => {
                debug!("rnstatus timed out");
                return features;
            }
        };

        let data: Value = match serde_json::from_slice(&output.stdout) {
            Ok(data) => data,
            Err(e) => {
                debug!("rnstatus output was not JSON: {e}");
                return features;
            }
        };
        if let Some(interfaces) = data.get("interfaces").and_then(Value::as_array) {
            for iface in interfaces {
                if let Some(feature) = parse_rns_interface(iface) {
                    features.push(feature);
                }
            }
        }
        debug!("rnstatus returned {} interfaces", features.len());
        features
    }

    /// Community hub REST API: telemetry first (it has positions), then the
    /// node registry.
    async fn fetch_from_hub(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        for endpoint in ["/api/v1/telemetry", "/api/v1/nodes"] {
            let url = format!("{}{endpoint}", self.hub_base);
            let mut request = self.client.get(&url).header("Accept", "application/json");
            if let Some(key) = &self.hub_api_key {
                request = request.header("X-API-Key", key);
            }
            let data: Value = match request.send().await {
                Ok(resp) => match resp.json().await {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("hub API {endpoint} bad JSON: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    debug!("hub API {endpoint} unavailable: {e}");
                    continue;
                }
            };

            let nodes = match &data {
                Value::Array(list) => list.clone(),
                Value::Object(obj) => obj
                    .get("items")
                    .or_else(|| obj.get("nodes"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            for node in &nodes {
                if let Some(feature) = parse_hub_node(node) {
                    features.push(feature);
                }
            }
            if !features.is_empty() {
                debug!("hub API ({endpoint}) returned {} nodes", features.len());
                break;
            }
        }
        features
    }

    async fn fetch_from_cache(&self, path: &PathBuf) -> Vec<Feature> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let data: Value = match serde_json::from_slice(&raw) {
            Ok(data) => data,
            Err(e) => {
                debug!("reticulum cache read failed: {e}");
                return Vec::new();
            }
        };
        let mut features = Vec::new();
        if data.get("type").and_then(Value::as_str) == Some("FeatureCollection") {
            if let Some(list) = data.get("features").and_then(Value::as_array) {
                for item in list {
                    let network = item
                        .pointer("/properties/network")
                        .and_then(Value::as_str)
                        .unwrap_or("reticulum");
                    if network == "reticulum" {
                        if let Ok(feature) = serde_json::from_value::<Feature>(item.clone()) {
                            features.push(feature);
                        }
                    }
                }
            }
        }
        features
    }
}

#[async_trait]
impl Collector for ReticulumCollector {
    fn source_name(&self) -> &'static str {
        "reticulum"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut features: Vec<Feature> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut batches = vec![self.fetch_from_rnstatus().await, self.fetch_from_hub().await];
        for path in &self.cache_paths {
            batches.push(self.fetch_from_cache(path).await);
        }
        for batch in batches {
            for feature in batch {
                if let Some(id) = feature.id() {
                    if seen.insert(id.to_string()) {
                        features.push(feature);
                    }
                }
            }
        }

        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

fn parse_rns_interface(iface: &Value) -> Option<Feature> {
    let (lat, lon) = validate_coordinates(
        iface.get("latitude").and_then(Value::as_f64),
        iface.get("longitude").and_then(Value::as_f64),
        false,
    )?;

    let name = iface.get("name").and_then(Value::as_str).unwrap_or("Unknown");
    let kind = iface
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_lowercase();
    let node_id = iface.get("hash").and_then(Value::as_str).unwrap_or(name);

    let mut extra = Map::new();
    extra.insert("rns_interface_type".into(), Value::String(kind.clone()));
    extra.insert(
        "is_online".into(),
        Value::Bool(iface.get("status").and_then(Value::as_str) == Some("up")),
    );
    insert_opt(&mut extra, "description", iface.get("description").and_then(Value::as_str));
    insert_opt(&mut extra, "altitude", iface.get("height").and_then(Value::as_f64));

    Some(node_feature(node_id, lat, lon, "reticulum", name, display_node_type(&kind), extra))
}

fn parse_hub_node(node: &Value) -> Option<Feature> {
    let mut lat = node
        .get("latitude")
        .or_else(|| node.get("lat"))
        .and_then(Value::as_f64);
    let mut lon = node
        .get("longitude")
        .or_else(|| node.get("lon"))
        .and_then(Value::as_f64);

    // Position may be nested under telemetry or location
    if lat.is_none() || lon.is_none() {
        for key in ["position", "location", "telemetry"] {
            if let Some(pos) = node.get(key).filter(|v| v.is_object()) {
                lat = pos.get("latitude").or_else(|| pos.get("lat")).and_then(Value::as_f64);
                lon = pos.get("longitude").or_else(|| pos.get("lon")).and_then(Value::as_f64);
                if lat.is_some() && lon.is_some() {
                    break;
                }
            }
        }
    }
    let (lat, lon) = validate_coordinates(lat, lon, false)?;

    let node_id = ["destination_hash", "hash", "identity", "id"]
        .iter()
        .find_map(|k| node.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())?
        .to_string();
    let name = node
        .get("display_name")
        .or_else(|| node.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| node_id.chars().take(16).collect());
    let kind = node
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_lowercase();

    let mut extra = Map::new();
    extra.insert("rns_interface_type".into(), Value::String(kind.clone()));
    extra.insert("source".into(), Value::String("rch".into()));
    insert_opt(
        &mut extra,
        "is_online",
        node.get("online").or_else(|| node.get("is_online")).and_then(Value::as_bool),
    );
    insert_opt(
        &mut extra,
        "last_seen",
        node.get("last_seen").or_else(|| node.get("updated_at")).cloned(),
    );
    insert_opt(&mut extra, "description", node.get("description").and_then(Value::as_str));
    insert_opt(
        &mut extra,
        "altitude",
        node.get("altitude").or_else(|| node.get("height")).and_then(Value::as_f64),
    );

    Some(node_feature(&node_id, lat, lon, "reticulum", &name, display_node_type(&kind), extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rns_interface_parsed() {
        let iface = json!({
            "name": "RNode LoRa",
            "type": "RNode",
            "hash": "3f2a9bc4de01",
            "latitude": 40.0,
            "longitude": -105.2,
            "status": "up",
            "height": 1700.0,
        });
        let feature = parse_rns_interface(&iface).unwrap();
        assert_eq!(feature.properties["id"], json!("3f2a9bc4de01"));
        assert_eq!(feature.properties["node_type"], json!("RNode (LoRa)"));
        assert_eq!(feature.properties["is_online"], json!(true));
        assert_eq!(feature.properties["altitude"], json!(1700.0));
    }

    #[test]
    fn hub_node_with_nested_position() {
        let node = json!({
            "destination_hash": "c0ffee00c0ffee00",
            "display_name": "Basecamp",
            "type": "nomadnet",
            "telemetry": {"lat": 39.7, "lon": -104.9},
            "online": true,
        });
        let feature = parse_hub_node(&node).unwrap();
        assert_eq!(feature.properties["id"], json!("c0ffee00c0ffee00"));
        assert_eq!(feature.properties["name"], json!("Basecamp"));
        assert_eq!(feature.properties["node_type"], json!("NomadNet"));
    }

    #[test]
    fn hub_node_without_identity_dropped() {
        let node = json!({"latitude": 10.0, "longitude": 10.0});
        assert!(parse_hub_node(&node).is_none());
    }
}
