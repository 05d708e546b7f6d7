//! NOAA weather alert collector.
//!
//! Fetches active alerts from the National Weather Service API, which
//! returns native GeoJSON with Polygon/MultiPolygon geometries. Features
//! without geometry (national-level text alerts) cannot be rendered and are
//! dropped, as are expired alerts. Output is deduplicated by alert id and
//! sorted most-severe-first.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::geojson::{Feature, FeatureCollection};

use super::{Collector, FetchError, USER_AGENT};

/// NOAA severity → display color.
pub fn severity_color(severity: &str) -> &'static str {
    match severity {
        "Extreme" => "#d32f2f",
        "Severe" => "#f44336",
        "Moderate" => "#ff9800",
        "Minor" => "#ffeb3b",
        _ => "#9e9e9e",
    }
}

/// NOAA severity → sort order (lower = more severe).
pub fn severity_order(severity: &str) -> i64 {
    match severity {
        "Extreme" => 0,
        "Severe" => 1,
        "Moderate" => 2,
        "Minor" => 3,
        _ => 4,
    }
}

pub struct NoaaAlertCollector {
    client: reqwest::Client,
    base_url: String,
    area: Option<String>,
    severity_filter: Option<Vec<String>>,
}

impl NoaaAlertCollector {
    pub fn new(area: Option<String>, severity_filter: Option<Vec<String>>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: "https://api.weather.gov/alerts/active".to_string(),
            area,
            severity_filter,
        }
    }

    fn build_url(&self) -> String {
        let mut params = vec![
            "status=actual".to_string(),
            "message_type=alert,update".to_string(),
        ];
        if let Some(area) = &self.area {
            params.push(format!("area={area}"));
        }
        if let Some(filter) = &self.severity_filter {
            if !filter.is_empty() {
                params.push(format!("severity={}", filter.join(",")));
            }
        }
        format!("{}?{}", self.base_url, params.join("&"))
    }
}

#[async_trait]
impl Collector for NoaaAlertCollector {
    fn source_name(&self) -> &'static str {
        "noaa_alerts"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let raw: Value = self
            .client
            .get(self.build_url())
            .header("Accept", "application/geo+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let features = process_features(
            raw.get("features").and_then(Value::as_array).cloned().unwrap_or_default(),
            Utc::now(),
        );
        let mut fc = FeatureCollection::new(features, self.source_name());
        let count = fc.features.len();
        fc.properties.insert("alert_count".into(), json!(count));
        Ok(fc)
    }
}

/// Filter, deduplicate, enrich, and sort raw NWS features.
fn process_features(raw_features: Vec<Value>, now: DateTime<Utc>) -> Vec<Feature> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut processed: Vec<Feature> = Vec::new();

    for feature in raw_features {
        let Some(geometry) = feature.get("geometry").filter(|g| !g.is_null()).cloned() else {
            continue;
        };
        let props = feature.get("properties").cloned().unwrap_or(Value::Null);
        let alert_id = props.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !seen.insert(alert_id.clone()) {
            continue;
        }

        // Drop alerts whose expiry is parseable and in the past; keep
        // anything with an unparseable stamp
        let expires = props.get("expires").and_then(Value::as_str);
        if let Some(expiry) = expires.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
            if expiry < now {
                continue;
            }
        }

        let severity = props
            .get("severity")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        let mut out = Map::new();
        out.insert("id".into(), json!(alert_id));
        out.insert("network".into(), json!("noaa_alerts"));
        for (key, source_key) in [
            ("event", "event"),
            ("headline", "headline"),
            ("description", "description"),
            ("certainty", "certainty"),
            ("urgency", "urgency"),
            ("area_desc", "areaDesc"),
            ("sender_name", "senderName"),
        ] {
            out.insert(
                key.into(),
                json!(props.get(source_key).and_then(Value::as_str).unwrap_or("")),
            );
        }
        out.insert("onset".into(), props.get("onset").cloned().unwrap_or(Value::Null));
        out.insert("expires".into(), props.get("expires").cloned().unwrap_or(Value::Null));
        out.insert("severity".into(), json!(severity));
        out.insert("color".into(), json!(severity_color(&severity)));
        out.insert("severity_order".into(), json!(severity_order(&severity)));

        processed.push(Feature::with_geometry(geometry, out));
    }

    processed.sort_by_key(|f| {
        f.properties
            .get("severity_order")
            .and_then(Value::as_i64)
            .unwrap_or(4)
    });
    processed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(id: &str, severity: &str, expires: Option<&str>, geometry: Value) -> Value {
        json!({
            "geometry": geometry,
            "properties": {
                "id": id,
                "event": "Severe Thunderstorm Warning",
                "severity": severity,
                "expires": expires,
                "areaDesc": "Boulder County",
            },
        })
    }

    fn polygon() -> Value {
        json!({"type": "Polygon", "coordinates": [[[-105.3, 40.0], [-105.2, 40.0], [-105.2, 40.1], [-105.3, 40.0]]]})
    }

    #[test]
    fn geometry_less_features_dropped() {
        let features = process_features(
            vec![
                alert("a", "Severe", None, polygon()),
                json!({"geometry": null, "properties": {"id": "b", "severity": "Extreme"}}),
            ],
            Utc::now(),
        );
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].properties["id"], json!("a"));
    }

    #[test]
    fn duplicates_and_expired_dropped_unparseable_kept() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let features = process_features(
            vec![
                alert("a", "Severe", Some("2026-08-01T18:00:00Z"), polygon()),
                alert("a", "Severe", Some("2026-08-01T18:00:00Z"), polygon()),
                alert("b", "Minor", Some("2026-08-01T06:00:00Z"), polygon()),
                alert("c", "Moderate", Some("not a date"), polygon()),
            ],
            now,
        );
        let ids: Vec<&str> = features.iter().filter_map(Feature::id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn sorted_most_severe_first_with_colors() {
        let features = process_features(
            vec![
                alert("minor", "Minor", None, polygon()),
                alert("extreme", "Extreme", None, polygon()),
                alert("moderate", "Moderate", None, polygon()),
            ],
            Utc::now(),
        );
        let ids: Vec<&str> = features.iter().filter_map(Feature::id).collect();
        assert_eq!(ids, vec!["extreme", "moderate", "minor"]);
        assert_eq!(features[0].properties["color"], json!("#d32f2f"));
        assert_eq!(features[2].properties["color"], json!("#ffeb3b"));
    }
}
