//! Configuration management.
//!
//! Settings persist as JSON under the user config dir. Loading is
//! fail-soft: a missing or corrupt file falls back to defaults, and unknown
//! keys are ignored so newer files can be read by older builds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Network color scheme used by the map frontend.
pub fn network_colors() -> Value {
    json!({
        "meshtastic": "#66bb6a",
        "reticulum": "#ab47bc",
        "aredn": "#ff7043",
        "hamclock": "#42a5f5",
        "noaa_alerts": "#ffa726",
    })
}

/// Tile provider definitions for the Leaflet frontend.
pub fn tile_providers() -> Value {
    json!({
        "carto_dark": {
            "name": "CartoDB Dark Matter",
            "url": "https://{s}.basemaps.cartocdn.com/dark_all/{z}/{x}/{y}{r}.png",
            "attribution": "&copy; OSM &copy; CARTO",
            "max_zoom": "20",
        },
        "osm_standard": {
            "name": "OpenStreetMap",
            "url": "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
            "attribution": "&copy; OpenStreetMap contributors",
            "max_zoom": "19",
        },
        "osm_topo": {
            "name": "OpenTopoMap",
            "url": "https://tile.opentopomap.org/{z}/{x}/{y}.png",
            "attribution": "&copy; OpenTopoMap (CC-BY-SA)",
            "max_zoom": "17",
        },
        "esri_satellite": {
            "name": "Esri Satellite",
            "url": "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}",
            "attribution": "&copy; Esri",
            "max_zoom": "19",
        },
    })
}

/// User data directory (`~/.local/share/meshforge`), shared with the other
/// MeshForge tools whose caches the collectors read.
pub fn data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".local").join("share").join("meshforge")
}

/// Default settings file location.
pub fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".config").join("meshforge").join("maps").join("settings.json")
}

fn d_tile_provider() -> String { "carto_dark".into() }
fn d_true() -> bool { true }
fn d_localhost() -> String { "localhost".into() }
fn d_loopback() -> String { "127.0.0.1".into() }
fn d_hamclock_port() -> u16 { 8080 }
fn d_openhamclock_port() -> u16 { 3000 }
fn d_map_center_lat() -> f64 { 20.0 }
fn d_map_center_lon() -> f64 { -100.0 }
fn d_map_zoom() -> u8 { 4 }
fn d_cache_ttl_minutes() -> u64 { 15 }
fn d_http_port() -> u16 { 8808 }
fn d_mqtt_broker() -> String { mesh_wire::DEFAULT_BROKER.into() }
fn d_mqtt_port() -> u16 { mesh_wire::DEFAULT_PORT }
fn d_mqtt_topic() -> String { mesh_wire::DEFAULT_TOPIC.into() }
fn d_source_mode() -> String { "auto".into() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapsConfig {
    #[serde(default = "d_tile_provider")]
    pub default_tile_provider: String,
    #[serde(default = "d_true")]
    pub enable_meshtastic: bool,
    #[serde(default = "d_true")]
    pub enable_reticulum: bool,
    #[serde(default = "d_true")]
    pub enable_hamclock: bool,
    #[serde(default = "d_true")]
    pub enable_aredn: bool,
    #[serde(default = "d_true")]
    pub enable_noaa_alerts: bool,
    #[serde(default = "d_localhost")]
    pub hamclock_host: String,
    #[serde(default = "d_hamclock_port")]
    pub hamclock_port: u16,
    #[serde(default = "d_openhamclock_port")]
    pub openhamclock_port: u16,
    #[serde(default = "d_map_center_lat")]
    pub map_center_lat: f64,
    #[serde(default = "d_map_center_lon")]
    pub map_center_lon: f64,
    #[serde(default = "d_map_zoom")]
    pub map_default_zoom: u8,
    #[serde(default = "d_cache_ttl_minutes")]
    pub cache_ttl_minutes: u64,
    #[serde(default = "d_http_port")]
    pub http_port: u16,
    #[serde(default = "d_loopback")]
    pub http_host: String,
    #[serde(default = "d_loopback")]
    pub ws_host: String,
    #[serde(default = "d_mqtt_broker")]
    pub mqtt_broker: String,
    #[serde(default = "d_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "d_mqtt_topic")]
    pub mqtt_topic: String,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    /// NWS area filter, e.g. "CO" (none = nationwide).
    #[serde(default)]
    pub noaa_alerts_area: Option<String>,
    /// Comma-separated severity filter, e.g. "Severe,Extreme".
    #[serde(default)]
    pub noaa_alerts_severity: Option<String>,
    /// Meshtastic source selection: auto | mqtt_only | local_only.
    #[serde(default = "d_source_mode")]
    pub meshtastic_source_mode: String,
    /// AREDN sysinfo targets. Empty by default: until nodes are configured
    /// the AREDN collector serves cache data only.
    #[serde(default)]
    pub aredn_nodes: Vec<String>,
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            default_tile_provider: d_tile_provider(),
            enable_meshtastic: true,
            enable_reticulum: true,
            enable_hamclock: true,
            enable_aredn: true,
            enable_noaa_alerts: true,
            hamclock_host: d_localhost(),
            hamclock_port: d_hamclock_port(),
            openhamclock_port: d_openhamclock_port(),
            map_center_lat: d_map_center_lat(),
            map_center_lon: d_map_center_lon(),
            map_default_zoom: d_map_zoom(),
            cache_ttl_minutes: d_cache_ttl_minutes(),
            http_port: d_http_port(),
            http_host: d_loopback(),
            ws_host: d_loopback(),
            mqtt_broker: d_mqtt_broker(),
            mqtt_port: d_mqtt_port(),
            mqtt_topic: d_mqtt_topic(),
            mqtt_username: None,
            mqtt_password: None,
            noaa_alerts_area: None,
            noaa_alerts_severity: None,
            meshtastic_source_mode: d_source_mode(),
            aredn_nodes: Vec::new(),
        }
    }
}

impl MapsConfig {
    /// Load from disk, falling back to defaults on any failure.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => {
                    info!("loaded settings from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                info!("no settings file at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("saved settings to {}", path.display());
        Ok(())
    }

    pub fn cache_ttl_seconds(&self) -> f64 {
        (self.cache_ttl_minutes * 60) as f64
    }

    pub fn get_enabled_sources(&self) -> Vec<&'static str> {
        let mut sources = Vec::new();
        if self.enable_meshtastic {
            sources.push("meshtastic");
        }
        if self.enable_reticulum {
            sources.push("reticulum");
        }
        if self.enable_hamclock {
            sources.push("hamclock");
        }
        if self.enable_aredn {
            sources.push("aredn");
        }
        if self.enable_noaa_alerts {
            sources.push("noaa_alerts");
        }
        sources
    }

    pub fn noaa_severity_list(&self) -> Option<Vec<String>> {
        self.noaa_alerts_severity.as_ref().map(|s| {
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
    }

    /// Public view of the settings for `/api/config` (credentials omitted).
    pub fn to_public_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut value {
            map.remove("mqtt_username");
            map.remove("mqtt_password");
        }
        value
    }
}
