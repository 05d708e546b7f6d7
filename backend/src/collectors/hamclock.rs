//! HamClock / propagation collector.
//!
//! Space weather and HF propagation overlay data:
//!   PRIMARY:  HamClock or OpenHamClock REST API (`key=value` text)
//!   FALLBACK: NOAA SWPC public JSON endpoints
//!
//! Port probing tries the OpenHamClock community successor first, then the
//! legacy HamClock port; the first `get_sys.txt` response pins the variant
//! for the rest of the cycle. The solar terminator is always computed
//! locally. Overlay data rides in the FeatureCollection `properties` —
//! this collector emits no node features.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Timelike, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::geojson::{iso_now, FeatureCollection};

use super::{Collector, FetchError, USER_AGENT};

// NOAA SWPC endpoints (fallback when HamClock is unavailable)
const SWPC_SOLAR_FLUX: &str = "https://services.swpc.noaa.gov/products/summary/10cm-flux.json";
const SWPC_KP_INDEX: &str = "https://services.swpc.noaa.gov/products/noaa-planetary-k-index.json";
const SWPC_SOLAR_WIND: &str = "https://services.swpc.noaa.gov/products/summary/solar-wind-speed.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    HamClock,
    OpenHamClock,
}

impl Variant {
    fn as_str(&self) -> &'static str {
        match self {
            Self::HamClock => "hamclock",
            Self::OpenHamClock => "openhamclock",
        }
    }

    fn source_label(&self) -> &'static str {
        match self {
            Self::HamClock => "HamClock API",
            Self::OpenHamClock => "OpenHamClock API",
        }
    }
}

/// Identify which variant answered a `get_sys.txt` probe.
fn detect_variant(sys_text: &str) -> Variant {
    if sys_text.to_ascii_lowercase().contains("openhamclock") {
        Variant::OpenHamClock
    } else {
        Variant::HamClock
    }
}

/// Parse a HamClock `key=value` text response.
fn parse_key_value(data: &str) -> BTreeMap<String, String> {
    data.lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[derive(Default)]
struct DetectState {
    api_base: Option<String>,
    variant: Option<Variant>,
    // probe failures, kept distinct: "timeout: ..." vs "http error: ..."
    last_probe_error: Option<String>,
}

pub struct HamClockCollector {
    client: reqwest::Client,
    host: String,
    legacy_port: u16,
    openhamclock_port: u16,
    state: Mutex<DetectState>,
}

impl HamClockCollector {
    pub fn new(host: &str, legacy_port: u16, openhamclock_port: u16) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            host: host.to_string(),
            legacy_port,
            openhamclock_port,
            state: Mutex::new(DetectState::default()),
        }
    }

    /// Probe both ports, OpenHamClock first. Pins the winning base URL and
    /// variant; on total failure records the probe error for health info.
    async fn probe(&self) -> bool {
        let mut candidates = Vec::new();
        if self.openhamclock_port != self.legacy_port {
            candidates.push((self.openhamclock_port, true));
        }
        candidates.push((self.legacy_port, false));

        let mut last_error = None;
        for (port, is_community) in candidates {
            let base = format!("http://{}:{port}", self.host);
            match self.fetch_text(&format!("{base}/get_sys.txt")).await {
                Ok(raw) if !raw.is_empty() => {
                    let variant = detect_variant(&raw);
                    if !is_community && self.openhamclock_port != self.legacy_port {
                        info!(
                            "{} detected on legacy port {port} (OpenHamClock port {} unavailable)",
                            variant.as_str(),
                            self.openhamclock_port
                        );
                    }
                    let mut state = self.state.lock().unwrap();
                    state.api_base = Some(base);
                    state.variant = Some(variant);
                    state.last_probe_error = None;
                    return true;
                }
                Ok(_) => last_error = Some("http error: empty get_sys.txt response".to_string()),
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        let mut state = self.state.lock().unwrap();
        state.api_base = None;
        state.variant = None;
        state.last_probe_error = last_error;
        false
    }

    fn api_base(&self) -> Option<String> {
        self.state.lock().unwrap().api_base.clone()
    }

    fn variant(&self) -> Option<Variant> {
        self.state.lock().unwrap().variant
    }

    async fn fetch_endpoint(&self, endpoint: &str) -> Option<String> {
        let base = self.api_base()?;
        match self.fetch_text(&format!("{base}{endpoint}")).await {
            Ok(raw) if !raw.is_empty() => Some(raw),
            Ok(_) => None,
            Err(e) => {
                debug!("hamclock {endpoint} fetch failed: {e}");
                None
            }
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let resp = resp.error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn fetch_json(&self, url: &str) -> Option<Value> {
        match self.client.get(url).header("Accept", "application/json").send().await {
            Ok(resp) => resp.json().await.ok(),
            Err(e) => {
                debug!("failed to fetch {url}: {e}");
                None
            }
        }
    }

    // ── HamClock API methods ──────────────────────────────────────────────

    async fn fetch_space_weather_hamclock(&self) -> Map<String, Value> {
        let mut weather = Map::new();
        let label = self
            .variant()
            .map(|v| v.source_label())
            .unwrap_or("HamClock API");
        weather.insert("source".into(), json!(label));
        weather.insert("fetched_at".into(), json!(iso_now()));

        let Some(raw) = self.fetch_endpoint("/get_spacewx.txt").await else {
            return weather;
        };
        let parsed = parse_key_value(&raw);

        // Map HamClock response keys onto the standard names
        let key_map: [(&str, &[&str]); 7] = [
            ("solar_flux", &["sfi", "flux"]),
            ("kp_index", &["kp"]),
            ("a_index", &["a", "a_index"]),
            ("xray_flux", &["xray", "x-ray"]),
            ("ssn", &["ssn", "sunspot", "sunspots"]),
            ("proton_flux", &["proton", "pf"]),
            ("aurora", &["aurora", "aur"]),
        ];
        for (standard, candidates) in key_map {
            for (raw_key, value) in &parsed {
                if candidates.contains(&raw_key.to_ascii_lowercase().as_str()) {
                    weather.insert(standard.to_string(), json!(value));
                    break;
                }
            }
        }

        let sfi = weather.get("solar_flux").cloned();
        let kp = weather.get("kp_index").cloned();
        weather.insert(
            "band_conditions".into(),
            json!(assess_band_conditions(sfi.as_ref(), kp.as_ref())),
        );
        weather
    }

    async fn fetch_band_conditions(&self) -> Option<Value> {
        let raw = self.fetch_endpoint("/get_bc.txt").await?;
        let parsed = parse_key_value(&raw);
        let mut bands = Map::new();
        for (key, value) in &parsed {
            let key_lower = key.to_ascii_lowercase();
            let group = if key_lower.contains("80") || key_lower.contains("40") {
                "80m-40m"
            } else if key_lower.contains("30") || key_lower.contains("20") {
                "30m-20m"
            } else if key_lower.contains("17") || key_lower.contains("15") {
                "17m-15m"
            } else if key_lower.contains("12") || key_lower.contains("10") {
                "12m-10m"
            } else {
                continue;
            };
            bands.insert(group.to_string(), json!(value));
        }
        if bands.is_empty() {
            return None;
        }
        Some(json!({ "bands": bands, "raw": parsed }))
    }

    async fn fetch_voacap(&self) -> Option<Value> {
        let raw = self.fetch_endpoint("/get_voacap.txt").await?;
        let mut path = String::new();
        let mut utc = String::new();
        let mut bands = Map::new();

        for (key, value) in parse_key_value(&raw) {
            let key = key.to_ascii_lowercase();
            if key == "path" {
                path = value;
            } else if key == "utc" {
                utc = value;
            } else if key.contains('m') {
                // Band rows: "80m=23,12" -> reliability 23%, SNR 12 dB
                let (rel, snr) = match value.split_once(',') {
                    Some((rel, snr)) => (rel.trim().parse::<i64>(), snr.trim().parse::<i64>().unwrap_or(0)),
                    None => (value.trim().parse::<i64>(), 0),
                };
                match rel {
                    Ok(rel) => {
                        bands.insert(
                            key,
                            json!({
                                "reliability": rel,
                                "snr": snr,
                                "status": reliability_to_status(rel),
                            }),
                        );
                    }
                    Err(_) => debug!("could not parse VOACAP band {key}: {value}"),
                }
            }
        }
        if bands.is_empty() {
            return None;
        }

        let (best_band, best_rel) = bands
            .iter()
            .filter_map(|(band, data)| data.get("reliability").and_then(Value::as_i64).map(|r| (band.clone(), r)))
            .max_by_key(|(_, r)| *r)
            .map(|(b, r)| (Some(b), r))
            .unwrap_or((None, 0));

        Some(json!({
            "path": path,
            "utc": utc,
            "bands": bands,
            "best_band": best_band,
            "best_reliability": best_rel,
        }))
    }

    async fn fetch_station(&self, endpoint: &str) -> Option<Value> {
        let raw = self.fetch_endpoint(endpoint).await?;
        let parsed = parse_key_value(&raw);
        let lookup = |keys: &[&str]| -> String {
            keys.iter()
                .find_map(|k| {
                    parsed
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(k))
                        .map(|(_, v)| v.clone())
                })
                .unwrap_or_default()
        };
        Some(json!({
            "lat": lookup(&["lat"]),
            "lon": lookup(&["lng", "lon"]),
            "grid": lookup(&["grid"]),
            "call": lookup(&["call"]),
        }))
    }

    async fn fetch_dxspots(&self) -> Option<Value> {
        let raw = self.fetch_endpoint("/get_dxspots.txt").await?;
        let mut spots = Vec::new();
        for (key, value) in parse_key_value(&raw) {
            // Spots come as indexed entries: Spot0=call freq de utc ...
            if !key.to_ascii_lowercase().starts_with("spot") {
                continue;
            }
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }
            let mut spot = Map::new();
            spot.insert("dx_call".into(), json!(parts[0]));
            spot.insert("freq_khz".into(), json!(parts[1]));
            spot.insert("de_call".into(), json!(parts[2]));
            if parts.len() >= 4 {
                spot.insert("utc".into(), json!(parts[3]));
            }
            if parts.len() >= 5 {
                spot.insert("comment".into(), json!(parts[4..].join(" ")));
            }
            spots.push(Value::Object(spot));
        }
        if spots.is_empty() {
            None
        } else {
            Some(Value::Array(spots))
        }
    }

    // ── NOAA fallback ─────────────────────────────────────────────────────

    async fn fetch_space_weather_noaa(&self) -> Map<String, Value> {
        let mut weather = Map::new();
        weather.insert("source".into(), json!("NOAA SWPC"));
        weather.insert("fetched_at".into(), json!(iso_now()));

        // Solar flux (10.7 cm / 2800 MHz)
        if let Some(sfi) = self.fetch_json(SWPC_SOLAR_FLUX).await {
            weather.insert("solar_flux".into(), sfi.get("Flux").cloned().unwrap_or(Value::Null));
        }

        // Planetary K-index: list of rows, latest last, Kp in column 1
        if let Some(Value::Array(rows)) = self.fetch_json(SWPC_KP_INDEX).await {
            if rows.len() > 1 {
                if let Some(Value::Array(latest)) = rows.last() {
                    if let Some(kp) = latest.get(1) {
                        let parsed = kp
                            .as_f64()
                            .or_else(|| kp.as_str().and_then(|s| s.parse().ok()));
                        if let Some(kp) = parsed {
                            weather.insert("kp_index".into(), json!(kp));
                        }
                    }
                }
            }
        }

        if let Some(wind) = self.fetch_json(SWPC_SOLAR_WIND).await {
            weather.insert(
                "solar_wind_speed".into(),
                wind.get("WindSpeed").cloned().unwrap_or(Value::Null),
            );
        }

        let sfi = weather.get("solar_flux").cloned();
        let kp = weather.get("kp_index").cloned();
        weather.insert(
            "band_conditions".into(),
            json!(assess_band_conditions(sfi.as_ref(), kp.as_ref())),
        );
        weather
    }
}

#[async_trait]
impl Collector for HamClockCollector {
    fn source_name(&self) -> &'static str {
        "hamclock"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let hamclock_up = self.probe().await;

        let (space_weather, band_conditions, voacap, de, dx, dxspots) = if hamclock_up {
            (
                self.fetch_space_weather_hamclock().await,
                self.fetch_band_conditions().await,
                self.fetch_voacap().await,
                self.fetch_station("/get_de.txt").await,
                self.fetch_station("/get_dx.txt").await,
                self.fetch_dxspots().await,
            )
        } else {
            (self.fetch_space_weather_noaa().await, None, None, None, None, None)
        };

        let terminator = solar_terminator();

        let variant = self.variant();
        let (source_label, active_port) = match (hamclock_up, variant) {
            (true, Some(Variant::OpenHamClock)) => ("OpenHamClock API", self.openhamclock_port),
            (true, _) => ("HamClock API", self.legacy_port),
            (false, _) => ("NOAA SWPC", self.legacy_port),
        };

        let mut hamclock = Map::new();
        hamclock.insert("available".into(), json!(hamclock_up));
        hamclock.insert("source".into(), json!(source_label));
        hamclock.insert("variant".into(), json!(variant.map(|v| v.as_str())));
        hamclock.insert("host".into(), json!(self.host));
        hamclock.insert("port".into(), json!(active_port));
        if let Some(error) = self.state.lock().unwrap().last_probe_error.clone() {
            hamclock.insert("probe_error".into(), json!(error));
        }
        if let Some(v) = band_conditions {
            hamclock.insert("band_conditions".into(), v);
        }
        if let Some(v) = voacap {
            hamclock.insert("voacap".into(), v);
        }
        if let Some(v) = de {
            hamclock.insert("de_station".into(), v);
        }
        if let Some(v) = dx {
            hamclock.insert("dx_station".into(), v);
        }
        if let Some(v) = dxspots {
            hamclock.insert("dxspots".into(), v);
        }

        let mut fc = FeatureCollection::empty(self.source_name());
        fc.properties.insert("space_weather".into(), Value::Object(space_weather));
        fc.properties.insert("solar_terminator".into(), terminator);
        fc.properties.insert("hamclock".into(), Value::Object(hamclock));
        Ok(fc)
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn value_to_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Fixed band-condition table over SFI and Kp.
pub fn assess_band_conditions(sfi: Option<&Value>, kp: Option<&Value>) -> &'static str {
    let (Some(sfi), Some(kp)) = (value_to_f64(sfi), value_to_f64(kp)) else {
        return "unknown";
    };
    if kp >= 7.0 {
        return "poor"; // major geomagnetic storm
    }
    if kp >= 5.0 {
        return "fair"; // minor storm
    }
    if sfi >= 150.0 && kp < 4.0 {
        return "excellent";
    }
    if sfi >= 100.0 && kp < 4.0 {
        return "good";
    }
    if sfi >= 70.0 {
        return "fair";
    }
    "poor"
}

fn reliability_to_status(reliability: i64) -> &'static str {
    match reliability {
        r if r >= 80 => "excellent",
        r if r >= 60 => "good",
        r if r >= 40 => "fair",
        r if r > 0 => "poor",
        _ => "closed",
    }
}

/// Subsolar point for the day/night terminator. Declination from
/// day-of-year, subsolar longitude from the UTC hour (15°/hour westward
/// from noon). The terminator line itself is rendered client-side.
pub fn solar_terminator() -> Value {
    let now = Utc::now();
    let day_of_year = now.ordinal() as f64;
    let hour_utc = now.hour() as f64 + now.minute() as f64 / 60.0;

    let declination = -23.44 * (360.0 / 365.0 * (day_of_year + 10.0)).to_radians().cos();

    let mut subsolar_lon = (12.0 - hour_utc) * 15.0;
    if subsolar_lon > 180.0 {
        subsolar_lon -= 360.0;
    } else if subsolar_lon < -180.0 {
        subsolar_lon += 360.0;
    }

    json!({
        "subsolar_lat": declination,
        "subsolar_lon": subsolar_lon,
        "timestamp": now.to_rfc3339(),
    })
}
