//! # mesh-wire
//!
//! Meshtastic JSON-over-MQTT wire structures for the MeshForge Maps suite.
//!
//! These types are used by:
//! - `backend`: decoding broker traffic in the live MQTT subscriber
//! - `mesh-sim`: producing synthetic node traffic for development
//!
//! The Meshtastic firmware publishes one JSON object per message when JSON
//! output is enabled on the device. The envelope carries a `type` string
//! (`position`, `nodeinfo`, `telemetry`, `neighborinfo`) and a `payload`
//! object whose shape depends on the type. Protobuf `ServiceEnvelope`
//! traffic is not handled here.
//!
//! ## Coordinate conventions
//!
//! Positions arrive either as floating degrees (`latitude`/`longitude`) or
//! as the firmware's scaled integers (`latitude_i`/`longitude_i`, degrees
//! × 1e7). [`PositionPayload::coordinates`] accepts both and always returns
//! plain degrees.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scale factor applied to `latitude_i` / `longitude_i` integer fields.
pub const COORD_SCALE: f64 = 1e-7;

/// Default public broker parameters.
pub const DEFAULT_BROKER: &str = "mqtt.meshtastic.org";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC: &str = "msh/#";

// ── Node identity ─────────────────────────────────────────────────────────────

/// Render a numeric node number as the canonical `!xxxxxxxx` hex id.
pub fn format_node_id(num: u64) -> String {
    format!("!{num:08x}")
}

/// Check a Meshtastic node id: optional `!` prefix, 1–16 hex digits.
pub fn is_valid_node_id(id: &str) -> bool {
    let hex = id.strip_prefix('!').unwrap_or(id);
    !hex.is_empty() && hex.len() <= 16 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One JSON message as published by Meshtastic firmware with JSON output
/// enabled. `sender` is normally the `!hex` string; some firmware versions
/// emit only the numeric `from` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub sender: Option<Value>,
    #[serde(default, rename = "from")]
    pub from_num: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub payload: Value,
}

impl MqttEnvelope {
    /// Resolve the sending node's canonical id, trying `sender` first and
    /// falling back to the numeric `from` field.
    pub fn node_id(&self) -> Option<String> {
        match &self.sender {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => n.as_u64().map(format_node_id),
            _ => self.from_num.map(format_node_id),
        }
    }

    pub fn position(&self) -> Option<PositionPayload> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn nodeinfo(&self) -> Option<NodeInfoPayload> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn telemetry(&self) -> Option<TelemetryPayload> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn neighborinfo(&self) -> Option<NeighborInfoPayload> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionPayload {
    #[serde(default)]
    pub latitude_i: Option<i64>,
    #[serde(default)]
    pub longitude_i: Option<i64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub time: Option<i64>,
}

impl PositionPayload {
    /// Degrees `(lat, lon)` from whichever representation is present.
    /// Returns `None` for missing or out-of-range coordinates, and treats
    /// the firmware's `0/0` placeholder as missing.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat = match (self.latitude, self.latitude_i) {
            (Some(v), _) => v,
            (None, Some(i)) if i != 0 => i as f64 * COORD_SCALE,
            _ => return None,
        };
        let lon = match (self.longitude, self.longitude_i) {
            (Some(v), _) => v,
            (None, Some(i)) if i != 0 => i as f64 * COORD_SCALE,
            _ => return None,
        };
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        if lat == 0.0 && lon == 0.0 {
            return None;
        }
        Some((lat, lon))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfoPayload {
    #[serde(default, alias = "longname")]
    pub long_name: Option<String>,
    #[serde(default, alias = "shortname")]
    pub short_name: Option<String>,
    #[serde(default, alias = "hw_model")]
    pub hardware: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Device and environment metrics. Known metrics get named fields; anything
/// else the node reports rides along in `extra` and is stored verbatim by
/// the node store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub relative_humidity: Option<f64>,
    #[serde(default)]
    pub barometric_pressure: Option<f64>,
    #[serde(default)]
    pub channel_utilization: Option<f64>,
    #[serde(default)]
    pub air_util_tx: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborInfoPayload {
    #[serde(default)]
    pub neighbors: Vec<NeighborReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborReport {
    pub node_id: u64,
    #[serde(default)]
    pub snr: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_id_prefers_sender_string() {
        let env: MqttEnvelope = serde_json::from_value(json!({
            "type": "position",
            "sender": "!a1b2c3d4",
            "from": 123u64,
            "payload": {},
        }))
        .unwrap();
        assert_eq!(env.node_id().as_deref(), Some("!a1b2c3d4"));
    }

    #[test]
    fn node_id_falls_back_to_from_num() {
        let env: MqttEnvelope = serde_json::from_value(json!({
            "type": "telemetry",
            "from": 0xa1b2c3d4u64,
            "payload": {},
        }))
        .unwrap();
        assert_eq!(env.node_id().as_deref(), Some("!a1b2c3d4"));
    }

    #[test]
    fn scaled_integer_coordinates_convert() {
        let pos = PositionPayload {
            latitude_i: Some(400_123_456),
            longitude_i: Some(-1_051_234_567),
            ..Default::default()
        };
        let (lat, lon) = pos.coordinates().unwrap();
        assert!((lat - 40.0123456).abs() < 1e-9);
        assert!((lon + 105.1234567).abs() < 1e-9);
    }

    #[test]
    fn float_coordinates_pass_through() {
        let pos = PositionPayload {
            latitude: Some(40.0),
            longitude: Some(-105.0),
            ..Default::default()
        };
        assert_eq!(pos.coordinates(), Some((40.0, -105.0)));
    }

    #[test]
    fn zero_and_out_of_range_rejected() {
        let zero = PositionPayload {
            latitude_i: Some(0),
            longitude_i: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.coordinates(), None);

        let bad = PositionPayload {
            latitude: Some(91.0),
            longitude: Some(0.0),
            ..Default::default()
        };
        assert_eq!(bad.coordinates(), None);
    }

    #[test]
    fn node_id_validation() {
        assert!(is_valid_node_id("!a1b2c3d4"));
        assert!(is_valid_node_id("a1b2c3d4"));
        assert!(is_valid_node_id("!ABCDEF0123456789"));
        assert!(!is_valid_node_id(""));
        assert!(!is_valid_node_id("!"));
        assert!(!is_valid_node_id("!xyz"));
        assert!(!is_valid_node_id("!a1b2c3d4a1b2c3d4a")); // 17 digits
        assert!(!is_valid_node_id("node.local.mesh"));
    }

    #[test]
    fn telemetry_extra_fields_survive() {
        let env: MqttEnvelope = serde_json::from_value(json!({
            "type": "telemetry",
            "sender": "!01020304",
            "payload": {"battery_level": 87, "iaq": 42, "co2": 415.5},
        }))
        .unwrap();
        let telem = env.telemetry().unwrap();
        assert_eq!(telem.battery_level, Some(87.0));
        assert_eq!(telem.extra.get("iaq"), Some(&json!(42)));
        assert_eq!(telem.extra.get("co2"), Some(&json!(415.5)));
    }
}
