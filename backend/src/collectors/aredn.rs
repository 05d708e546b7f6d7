//! AREDN collector.
//!
//! Queries configured node hostnames' sysinfo endpoints on the mesh and
//! merges two on-disk caches. Responses must look like an actual AREDN
//! sysinfo document (`node`, `sysinfo`, or `meshrf` present) — anything
//! else on the same port is rejected. LQM neighbor entries become topology
//! links; blocked links are dropped and quality is clamped to 0–100.
//!
//! The default target list is empty: until nodes are configured the
//! collector serves cache data only.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::geojson::{insert_opt, node_feature, validate_coordinates, Feature, FeatureCollection};
use crate::node_store::TopologyLink;

use super::{Collector, FetchError, USER_AGENT};

/// Raw LQM link metrics between two named nodes.
#[derive(Debug, Clone)]
struct LqmLink {
    source: String,
    target: String,
    snr: Option<f64>,
    noise: Option<f64>,
    quality: Option<i64>,
    tx_quality: Option<i64>,
    rx_quality: Option<i64>,
    link_type: Option<String>,
}

#[derive(Default)]
struct TopoState {
    links: Vec<LqmLink>,
    node_coords: HashMap<String, (f64, f64)>,
}

pub struct ArednCollector {
    client: reqwest::Client,
    targets: Vec<String>,
    cache_paths: Vec<PathBuf>,
    topo: Mutex<TopoState>,
}

impl ArednCollector {
    pub fn new(targets: Vec<String>, cache_paths: Vec<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            targets,
            cache_paths,
            topo: Mutex::new(TopoState::default()),
        }
    }

    /// Query one node's sysinfo API. The AREDN API listens on 8080, so a
    /// bare hostname gets `:8080` appended; targets carrying a port (or a
    /// bracketed IPv6 literal) are used as-is.
    async fn fetch_from_node(&self, target: &str) -> (Vec<Feature>, Vec<LqmLink>) {
        let mut features = Vec::new();
        let mut links = Vec::new();

        let host = if target.contains(':') && !target.starts_with('[') {
            target.to_string()
        } else {
            format!("{target}:8080")
        };
        let url = format!("http://{host}/a/sysinfo?lqm=1");

        let data: Value = match self.client.get(&url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(data) => data,
                Err(e) => {
                    debug!("AREDN node {target}: bad JSON: {e}");
                    return (features, links);
                }
            },
            Err(e) => {
                debug!("AREDN node {target} unreachable: {e}");
                return (features, links);
            }
        };

        let Value::Object(obj) = &data else {
            debug!("AREDN node {target}: response is not a JSON object");
            return (features, links);
        };
        if !(obj.contains_key("node") || obj.contains_key("sysinfo") || obj.contains_key("meshrf")) {
            debug!("AREDN node {target}: missing expected AREDN fields");
            return (features, links);
        }

        if let Some(feature) = parse_sysinfo(&data, target) {
            features.push(feature);
        }

        let node_name = data
            .get("node")
            .and_then(Value::as_str)
            .unwrap_or(target)
            .to_string();
        if let Some(lqm) = data.get("lqm").and_then(Value::as_array) {
            for neighbor in lqm {
                if let Some(link) = parse_lqm_neighbor(neighbor, &node_name) {
                    links.push(link);
                }
            }
        }
        (features, links)
    }

    async fn fetch_from_cache(&self, path: &PathBuf) -> Vec<Feature> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let data: Value = match serde_json::from_slice(&raw) {
            Ok(data) => data,
            Err(e) => {
                debug!("AREDN cache read failed: {e}");
                return Vec::new();
            }
        };
        let mut features = Vec::new();
        if data.get("type").and_then(Value::as_str) == Some("FeatureCollection") {
            if let Some(list) = data.get("features").and_then(Value::as_array) {
                for item in list {
                    if item.pointer("/properties/network").and_then(Value::as_str) == Some("aredn") {
                        if let Ok(feature) = serde_json::from_value::<Feature>(item.clone()) {
                            features.push(feature);
                        }
                    }
                }
            }
        }
        features
    }

    /// AREDN topology links with coordinates resolved from the last
    /// collection's node positions. Links missing an endpoint are still
    /// reported, without coordinates.
    pub fn get_topology_links(&self) -> Vec<TopologyLink> {
        let topo = self.topo.lock().unwrap();
        topo.links
            .iter()
            .map(|lqm| {
                let mut link = TopologyLink::new(&lqm.source, &lqm.target, lqm.snr, "aredn");
                if let (Some(&(slat, slon)), Some(&(tlat, tlon))) = (
                    topo.node_coords.get(&lqm.source),
                    topo.node_coords.get(&lqm.target),
                ) {
                    link.source_lat = Some(slat);
                    link.source_lon = Some(slon);
                    link.target_lat = Some(tlat);
                    link.target_lon = Some(tlon);
                }
                insert_opt(&mut link.extra, "noise", lqm.noise);
                insert_opt(&mut link.extra, "aredn_quality", lqm.quality);
                insert_opt(&mut link.extra, "tx_quality", lqm.tx_quality);
                insert_opt(&mut link.extra, "rx_quality", lqm.rx_quality);
                insert_opt(&mut link.extra, "link_type", lqm.link_type.clone());
                link
            })
            .collect()
    }
}

#[async_trait]
impl Collector for ArednCollector {
    fn source_name(&self) -> &'static str {
        "aredn"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut features: Vec<Feature> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut links: Vec<LqmLink> = Vec::new();

        for target in &self.targets {
            let (node_features, node_links) = self.fetch_from_node(target).await;
            links.extend(node_links);
            for feature in node_features {
                if let Some(id) = feature.id() {
                    if seen.insert(id.to_string()) {
                        features.push(feature);
                    }
                }
            }
        }

        for path in &self.cache_paths {
            for feature in self.fetch_from_cache(path).await {
                if let Some(id) = feature.id() {
                    if seen.insert(id.to_string()) {
                        features.push(feature);
                    }
                }
            }
        }

        // Coordinate lookup so LQM endpoints can be positioned later
        let mut node_coords = HashMap::new();
        for feature in &features {
            if let (Some(id), Some(coords)) = (
                feature.id(),
                feature.geometry.get("coordinates").and_then(Value::as_array),
            ) {
                if coords.len() >= 2 {
                    if let (Some(lon), Some(lat)) = (coords[0].as_f64(), coords[1].as_f64()) {
                        node_coords.insert(id.to_string(), (lat, lon));
                    }
                }
            }
        }

        {
            let mut topo = self.topo.lock().unwrap();
            topo.links = links;
            topo.node_coords = node_coords;
        }

        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

fn parse_sysinfo(data: &Value, target: &str) -> Option<Feature> {
    let (lat, lon) = validate_coordinates(
        data.get("lat").and_then(coerce_f64),
        data.get("lon").and_then(coerce_f64),
        false,
    )?;

    let node_name = data.get("node").and_then(Value::as_str).unwrap_or(target);
    let model = data.get("model").and_then(Value::as_str).unwrap_or("");
    let firmware = data
        .get("firmware_version")
        .and_then(Value::as_str)
        .unwrap_or("");
    let sysinfo = data.get("sysinfo").cloned().unwrap_or(Value::Null);
    let loads = sysinfo.get("loads").and_then(Value::as_array).cloned();

    let mut extra = Map::new();
    if !model.is_empty() {
        extra.insert("hardware".into(), json!(model));
    }
    if !firmware.is_empty() {
        extra.insert("firmware".into(), json!(firmware));
        extra.insert("description".into(), json!(format!("AREDN {model} - {firmware}")));
    }
    insert_opt(&mut extra, "api_version", data.get("api_version").and_then(Value::as_str));
    insert_opt(&mut extra, "uptime", sysinfo.get("uptime").and_then(Value::as_str));
    insert_opt(
        &mut extra,
        "load_avg",
        loads.as_ref().and_then(|l| l.first()).and_then(Value::as_f64),
    );
    insert_opt(&mut extra, "grid_square", data.get("grid_square").and_then(Value::as_str));
    extra.insert("is_online".into(), Value::Bool(true));

    Some(node_feature(node_name, lat, lon, "aredn", node_name, "aredn_node", extra))
}

/// `lat`/`lon` arrive as strings on some firmware versions.
fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_lqm_neighbor(neighbor: &Value, source_node: &str) -> Option<LqmLink> {
    let name = neighbor.get("name").and_then(Value::as_str)?;
    if name.is_empty() {
        return None;
    }
    // LQM has decided this link is unusable
    if neighbor.get("blocked").and_then(Value::as_bool) == Some(true) {
        return None;
    }

    let snr = neighbor.get("snr").and_then(coerce_f64);
    let quality = neighbor
        .get("quality")
        .and_then(Value::as_i64)
        .filter(|q| (0..=100).contains(q));

    Some(LqmLink {
        source: source_node.to_string(),
        target: name.to_string(),
        snr,
        noise: neighbor.get("noise").and_then(Value::as_f64),
        quality,
        tx_quality: neighbor.get("tx_quality").and_then(Value::as_i64),
        rx_quality: neighbor.get("rx_quality").and_then(Value::as_i64),
        link_type: neighbor
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_parsed_into_feature() {
        let data = json!({
            "node": "KD0AAA-ridge",
            "lat": "39.95", "lon": "-105.27",
            "model": "Ubiquiti Rocket M5",
            "firmware_version": "3.24.4.0",
            "sysinfo": {"uptime": "5 days", "loads": [0.4, 0.3, 0.2]},
        });
        let feature = parse_sysinfo(&data, "kd0aaa").unwrap();
        assert_eq!(feature.properties["id"], json!("KD0AAA-ridge"));
        assert_eq!(feature.properties["network"], json!("aredn"));
        assert_eq!(feature.properties["load_avg"], json!(0.4));
        assert_eq!(feature.properties["is_online"], json!(true));
    }

    #[test]
    fn sysinfo_without_coordinates_dropped() {
        let data = json!({"node": "KD0AAA", "model": "hAP"});
        assert!(parse_sysinfo(&data, "kd0aaa").is_none());
    }

    #[test]
    fn lqm_blocked_and_invalid_entries_dropped() {
        assert!(parse_lqm_neighbor(
            &json!({"name": "KE0BBB", "blocked": true, "snr": 20}),
            "KD0AAA"
        )
        .is_none());
        assert!(parse_lqm_neighbor(&json!({"snr": 20}), "KD0AAA").is_none());

        // Out-of-range quality clamps to absent, string SNR parses
        let link = parse_lqm_neighbor(
            &json!({"name": "KE0BBB", "snr": "14.5", "quality": 180, "type": "RF"}),
            "KD0AAA",
        )
        .unwrap();
        assert_eq!(link.snr, Some(14.5));
        assert_eq!(link.quality, None);
        assert_eq!(link.link_type.as_deref(), Some("RF"));
    }

    #[tokio::test]
    async fn topology_links_resolve_known_coordinates() {
        let collector = ArednCollector::new(Vec::new(), Vec::new());
        {
            let mut topo = collector.topo.lock().unwrap();
            topo.links.push(LqmLink {
                source: "A".into(),
                target: "B".into(),
                snr: Some(12.0),
                noise: None,
                quality: Some(90),
                tx_quality: None,
                rx_quality: None,
                link_type: Some("RF".into()),
            });
            topo.links.push(LqmLink {
                source: "A".into(),
                target: "unknown".into(),
                snr: None,
                noise: None,
                quality: None,
                tx_quality: None,
                rx_quality: None,
                link_type: None,
            });
            topo.node_coords.insert("A".into(), (40.0, -105.0));
            topo.node_coords.insert("B".into(), (40.1, -105.1));
        }

        let links = collector.get_topology_links();
        assert_eq!(links.len(), 2);
        let resolved = links.iter().find(|l| l.target == "B").unwrap();
        assert!(resolved.has_coordinates());
        assert_eq!(resolved.extra["aredn_quality"], json!(90));
        let unresolved = links.iter().find(|l| l.target == "unknown").unwrap();
        assert!(!unresolved.has_coordinates());
    }
}
