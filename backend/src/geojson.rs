//! GeoJSON record shapes used by every collector and store.
//!
//! Features keep their geometry as raw JSON so polygon alerts from NOAA can
//! pass through untouched, while the constructors here only ever build
//! validated `Point` and `LineString` geometries. Null-valued properties are
//! stripped at construction time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ── Coordinate validation ─────────────────────────────────────────────────────

/// Validate a latitude/longitude pair. With `convert_int`, values whose
/// magnitude exceeds the valid degree range are treated as Meshtastic
/// integer-scaled degrees (× 1e7) and converted before the range check.
pub fn validate_coordinates(
    lat: Option<f64>,
    lon: Option<f64>,
    convert_int: bool,
) -> Option<(f64, f64)> {
    let (mut lat, mut lon) = (lat?, lon?);
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    if convert_int && (lat.abs() > 90.0 || lon.abs() > 180.0) {
        lat *= mesh_wire::COORD_SCALE;
        lon *= mesh_wire::COORD_SCALE;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Current time as an ISO-8601 UTC stamp (`2026-08-01T12:00:00Z`).
pub fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Feature ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_tag")]
    pub kind: String,
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

fn feature_tag() -> String {
    "Feature".to_string()
}

impl Feature {
    /// Point feature from pre-validated coordinates and a property map.
    pub fn point(lat: f64, lon: f64, properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_tag(),
            geometry: json!({ "type": "Point", "coordinates": [lon, lat] }),
            properties: strip_nulls(properties),
        }
    }

    /// LineString feature from `[lon, lat]` (optionally `[lon, lat, alt]`)
    /// coordinate rows.
    pub fn line_string(coordinates: Vec<Vec<f64>>, properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_tag(),
            geometry: json!({ "type": "LineString", "coordinates": coordinates }),
            properties: strip_nulls(properties),
        }
    }

    /// Feature with a passthrough geometry (NOAA polygons, snapshots).
    pub fn with_geometry(geometry: Value, properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_tag(),
            geometry,
            properties: strip_nulls(properties),
        }
    }

    /// The `properties.id` string, if present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.properties.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())
    }
}

/// Build the standard node feature all collectors emit: `id`, `name`,
/// `network`, `node_type` plus whatever extra properties the source knows.
pub fn node_feature(
    node_id: &str,
    lat: f64,
    lon: f64,
    network: &str,
    name: &str,
    node_type: &str,
    extra: Map<String, Value>,
) -> Feature {
    let mut props = Map::new();
    props.insert("id".into(), Value::String(node_id.to_string()));
    let display = if name.is_empty() { node_id } else { name };
    props.insert("name".into(), Value::String(display.to_string()));
    props.insert("network".into(), Value::String(network.to_string()));
    props.insert("node_type".into(), Value::String(node_type.to_string()));
    for (k, v) in extra {
        props.insert(k, v);
    }
    Feature::point(lat, lon, props)
}

fn strip_nulls(props: Map<String, Value>) -> Map<String, Value> {
    props.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

// ── FeatureCollection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "collection_tag")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

fn collection_tag() -> String {
    "FeatureCollection".to_string()
}

impl FeatureCollection {
    /// Wrap features with the standard `source` / `collected_at` /
    /// `node_count` metadata.
    pub fn new(features: Vec<Feature>, source: &str) -> Self {
        let mut properties = Map::new();
        properties.insert("source".into(), Value::String(source.to_string()));
        properties.insert("collected_at".into(), Value::String(iso_now()));
        properties.insert("node_count".into(), json!(features.len()));
        Self {
            kind: collection_tag(),
            features,
            properties,
        }
    }

    pub fn empty(source: &str) -> Self {
        Self::new(Vec::new(), source)
    }
}

/// Insert `key` only when the value is present; `None` never produces a
/// JSON null.
pub fn insert_opt<T: Into<Value>>(props: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(v) = value {
        let v = v.into();
        if !v.is_null() {
            props.insert(key.to_string(), v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_validated_and_ordered_lon_lat() {
        let f = node_feature("!a1", 40.0, -105.0, "meshtastic", "", "meshtastic_node", Map::new());
        let coords = f.geometry["coordinates"].as_array().unwrap();
        assert_eq!(coords[0].as_f64().unwrap(), -105.0);
        assert_eq!(coords[1].as_f64().unwrap(), 40.0);
        assert_eq!(f.properties["name"], json!("!a1"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert_eq!(validate_coordinates(Some(91.0), Some(0.0), false), None);
        assert_eq!(validate_coordinates(Some(0.0), Some(-181.0), false), None);
        assert_eq!(validate_coordinates(Some(f64::NAN), Some(0.0), false), None);
        assert_eq!(validate_coordinates(None, Some(0.0), false), None);
        assert_eq!(
            validate_coordinates(Some(40.5), Some(-105.5), false),
            Some((40.5, -105.5))
        );
    }

    #[test]
    fn validate_converts_scaled_integers() {
        let (lat, lon) =
            validate_coordinates(Some(400_000_000.0), Some(-1_050_000_000.0), true).unwrap();
        assert!((lat - 40.0).abs() < 1e-9);
        assert!((lon + 105.0).abs() < 1e-9);
        // Without conversion the same values are rejected
        assert_eq!(
            validate_coordinates(Some(400_000_000.0), Some(-1_050_000_000.0), false),
            None
        );
    }

    #[test]
    fn null_properties_stripped() {
        let mut extra = Map::new();
        extra.insert("battery".into(), json!(80));
        extra.insert("snr".into(), Value::Null);
        let f = node_feature("!a1", 1.0, 2.0, "meshtastic", "Alpha", "meshtastic_node", extra);
        assert!(f.properties.contains_key("battery"));
        assert!(!f.properties.contains_key("snr"));
    }

    #[test]
    fn collection_metadata() {
        let fc = FeatureCollection::new(
            vec![node_feature("!a", 1.0, 2.0, "m", "", "n", Map::new())],
            "meshtastic",
        );
        assert_eq!(fc.properties["source"], json!("meshtastic"));
        assert_eq!(fc.properties["node_count"], json!(1));
        assert!(fc.properties["collected_at"].as_str().unwrap().ends_with('Z'));
    }
}
