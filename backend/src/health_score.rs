//! Per-node composite health scoring.
//!
//! Five weighted components (battery 25, signal 25, freshness 20,
//! reliability 15, congestion 15). Nodes rarely report everything, so the
//! score is normalized over the components actually supplied: a node
//! reporting only battery and freshness is scored out of 45 and scaled to
//! 0–100.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Map, Value};

use crate::clock::now_secs;

pub const WEIGHT_BATTERY: f64 = 25.0;
pub const WEIGHT_SIGNAL: f64 = 25.0;
pub const WEIGHT_FRESHNESS: f64 = 20.0;
pub const WEIGHT_RELIABILITY: f64 = 15.0;
pub const WEIGHT_CONGESTION: f64 = 15.0;

const BATTERY_FULL: f64 = 80.0;
const BATTERY_LOW: f64 = 20.0;
const VOLTAGE_MIN: f64 = 3.0;
const VOLTAGE_HEALTHY: f64 = 3.7;

const SNR_EXCELLENT: f64 = 8.0;
const SNR_POOR: f64 = -10.0;
const MAX_HOPS_SCORED: f64 = 7.0;

const FRESH_THRESHOLD: f64 = 300.0;
const STALE_THRESHOLD: f64 = 3600.0;

const CHANNEL_UTIL_LOW: f64 = 25.0;
const CHANNEL_UTIL_HIGH: f64 = 75.0;

pub const MAX_SCORED_NODES: usize = 10_000;

/// Map a 0–100 score to its status label.
pub fn score_label(score: i64) -> &'static str {
    match score {
        s if s >= 80 => "excellent",
        s if s >= 60 => "good",
        s if s >= 40 => "fair",
        s if s >= 20 => "poor",
        _ => "critical",
    }
}

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

/// Linear interpolation between `bad` (0 points) and `good` (max points).
fn linear_score(value: f64, bad: f64, good: f64, max_points: f64) -> f64 {
    if good == bad {
        return if value >= good { max_points } else { 0.0 };
    }
    clamp((value - bad) / (good - bad), 0.0, 1.0) * max_points
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct NodeHealthScore {
    pub node_id: String,
    pub score: i64,
    pub status: &'static str,
    pub components: Map<String, Value>,
    pub available_weight: f64,
    pub timestamp: f64,
}

impl NodeHealthScore {
    pub fn to_value(&self) -> Value {
        json!({
            "node_id": self.node_id,
            "score": self.score,
            "status": self.status,
            "components": self.components,
            "available_weight": self.available_weight,
            "timestamp": self.timestamp,
        })
    }
}

fn get_f64(props: &Map<String, Value>, key: &str) -> Option<f64> {
    match props.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct NodeHealthScorer {
    max_nodes: usize,
    scores: Mutex<HashMap<String, NodeHealthScore>>,
}

impl Default for NodeHealthScorer {
    fn default() -> Self {
        Self::new(MAX_SCORED_NODES)
    }
}

impl NodeHealthScorer {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            scores: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the composite score for one node from its feature
    /// properties plus the connectivity state from the tracker.
    pub fn score_node(
        &self,
        node_id: &str,
        props: &Map<String, Value>,
        connectivity_state: Option<&str>,
        now: Option<f64>,
    ) -> NodeHealthScore {
        let now = now.unwrap_or_else(now_secs);
        let mut components = Map::new();
        let mut earned = 0.0;
        let mut available = 0.0;

        if let Some((points, detail)) = score_battery(props) {
            earned += points;
            available += WEIGHT_BATTERY;
            components.insert("battery".into(), component(points, WEIGHT_BATTERY, detail));
        }
        if let Some((points, detail)) = score_signal(props) {
            earned += points;
            available += WEIGHT_SIGNAL;
            components.insert("signal".into(), component(points, WEIGHT_SIGNAL, detail));
        }
        if let Some((points, detail)) = score_freshness(props, now) {
            earned += points;
            available += WEIGHT_FRESHNESS;
            components.insert("freshness".into(), component(points, WEIGHT_FRESHNESS, detail));
        }
        if let Some((points, detail)) = score_reliability(connectivity_state) {
            earned += points;
            available += WEIGHT_RELIABILITY;
            components.insert("reliability".into(), component(points, WEIGHT_RELIABILITY, detail));
        }
        if let Some((points, detail)) = score_congestion(props) {
            earned += points;
            available += WEIGHT_CONGESTION;
            components.insert("congestion".into(), component(points, WEIGHT_CONGESTION, detail));
        }

        let normalized = if available > 0.0 {
            clamp((earned / available * 100.0).round(), 0.0, 100.0) as i64
        } else {
            0
        };

        let result = NodeHealthScore {
            node_id: node_id.to_string(),
            score: normalized,
            status: score_label(normalized),
            components,
            available_weight: available,
            timestamp: now,
        };

        {
            let mut scores = self.scores.lock().unwrap();
            if scores.len() >= self.max_nodes && !scores.contains_key(node_id) {
                Self::evict_oldest_locked(&mut scores);
            }
            scores.insert(node_id.to_string(), result.clone());
        }
        result
    }

    pub fn get_node_score(&self, node_id: &str) -> Option<Value> {
        self.scores
            .lock()
            .unwrap()
            .get(node_id)
            .map(NodeHealthScore::to_value)
    }

    pub fn get_all_scores(&self) -> Map<String, Value> {
        self.scores
            .lock()
            .unwrap()
            .iter()
            .map(|(id, s)| (id.clone(), json!(s.score)))
            .collect()
    }

    pub fn get_all_details(&self) -> Vec<Value> {
        self.scores
            .lock()
            .unwrap()
            .values()
            .map(NodeHealthScore::to_value)
            .collect()
    }

    pub fn get_summary(&self) -> Value {
        let scores = self.scores.lock().unwrap();
        if scores.is_empty() {
            return json!({
                "scored_nodes": 0,
                "average_score": 0,
                "status_counts": {},
                "component_averages": {},
            });
        }

        let values: Vec<i64> = scores.values().map(|s| s.score).collect();
        let avg = values.iter().sum::<i64>() as f64 / values.len() as f64;

        let mut status_counts: HashMap<&'static str, u64> = HashMap::new();
        let mut component_totals: HashMap<String, (f64, u64)> = HashMap::new();
        for s in scores.values() {
            *status_counts.entry(s.status).or_insert(0) += 1;
            for (name, data) in &s.components {
                if let Some(score) = data.get("score").and_then(Value::as_f64) {
                    let slot = component_totals.entry(name.clone()).or_insert((0.0, 0));
                    slot.0 += score;
                    slot.1 += 1;
                }
            }
        }
        let component_averages: Map<String, Value> = component_totals
            .into_iter()
            .map(|(name, (total, count))| (name, json!(round1(total / count as f64))))
            .collect();

        json!({
            "scored_nodes": scores.len(),
            "average_score": round1(avg),
            "min_score": values.iter().min(),
            "max_score": values.iter().max(),
            "status_counts": status_counts,
            "component_averages": component_averages,
        })
    }

    pub fn remove_node(&self, node_id: &str) {
        self.scores.lock().unwrap().remove(node_id);
    }

    pub fn scored_node_count(&self) -> usize {
        self.scores.lock().unwrap().len()
    }

    fn evict_oldest_locked(scores: &mut HashMap<String, NodeHealthScore>) {
        let oldest = scores
            .values()
            .min_by(|a, b| {
                a.timestamp
                    .partial_cmp(&b.timestamp)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.node_id.clone());
        if let Some(id) = oldest {
            scores.remove(&id);
        }
    }
}

fn component(points: f64, max: f64, detail: Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert("score".into(), json!(round1(points)));
    out.insert("max".into(), json!(max));
    for (k, v) in detail {
        out.insert(k, v);
    }
    Value::Object(out)
}

// ── Component scorers ─────────────────────────────────────────────────────────

fn score_battery(props: &Map<String, Value>) -> Option<(f64, Map<String, Value>)> {
    let battery = get_f64(props, "battery").map(|b| clamp(b, 0.0, 100.0));
    let voltage = get_f64(props, "voltage");
    let mut detail = Map::new();

    let points = match (battery, voltage) {
        (Some(battery), Some(voltage)) => {
            // Both available: 60% battery level, 40% voltage
            detail.insert("battery_level".into(), json!(battery));
            detail.insert("voltage".into(), json!(voltage));
            linear_score(battery, BATTERY_LOW, BATTERY_FULL, WEIGHT_BATTERY * 0.6)
                + linear_score(voltage, VOLTAGE_MIN, VOLTAGE_HEALTHY, WEIGHT_BATTERY * 0.4)
        }
        (Some(battery), None) => {
            detail.insert("battery_level".into(), json!(battery));
            linear_score(battery, BATTERY_LOW, BATTERY_FULL, WEIGHT_BATTERY)
        }
        (None, Some(voltage)) => {
            detail.insert("voltage".into(), json!(voltage));
            linear_score(voltage, VOLTAGE_MIN, VOLTAGE_HEALTHY, WEIGHT_BATTERY)
        }
        (None, None) => return None,
    };
    Some((points, detail))
}

fn score_signal(props: &Map<String, Value>) -> Option<(f64, Map<String, Value>)> {
    let snr = get_f64(props, "snr");
    let hops = get_f64(props, "hops_away").map(|h| h.max(0.0));
    let mut detail = Map::new();

    let points = match (snr, hops) {
        (Some(snr), Some(hops)) => {
            // Both: 70% SNR, 30% hop distance
            detail.insert("snr".into(), json!(snr));
            detail.insert("hops_away".into(), json!(hops));
            linear_score(snr, SNR_POOR, SNR_EXCELLENT, WEIGHT_SIGNAL * 0.7)
                + linear_score(MAX_HOPS_SCORED - hops, 0.0, MAX_HOPS_SCORED, WEIGHT_SIGNAL * 0.3)
        }
        (Some(snr), None) => {
            detail.insert("snr".into(), json!(snr));
            linear_score(snr, SNR_POOR, SNR_EXCELLENT, WEIGHT_SIGNAL)
        }
        (None, Some(hops)) => {
            detail.insert("hops_away".into(), json!(hops));
            linear_score(MAX_HOPS_SCORED - hops, 0.0, MAX_HOPS_SCORED, WEIGHT_SIGNAL)
        }
        (None, None) => return None,
    };
    Some((points, detail))
}

fn score_freshness(props: &Map<String, Value>, now: f64) -> Option<(f64, Map<String, Value>)> {
    let last_seen = get_f64(props, "last_seen")?;
    // Clock skew protection
    let age = (now - last_seen).max(0.0);
    let points = linear_score(
        STALE_THRESHOLD - age,
        0.0,
        STALE_THRESHOLD - FRESH_THRESHOLD,
        WEIGHT_FRESHNESS,
    );
    let mut detail = Map::new();
    detail.insert("age_seconds".into(), json!(age as i64));
    Some((points, detail))
}

fn score_reliability(connectivity_state: Option<&str>) -> Option<(f64, Map<String, Value>)> {
    let state = connectivity_state?;
    let points = match state {
        "stable" => WEIGHT_RELIABILITY,
        "new" => WEIGHT_RELIABILITY * 0.7,
        "intermittent" => WEIGHT_RELIABILITY * 0.3,
        "offline" => 0.0,
        _ => WEIGHT_RELIABILITY * 0.5,
    };
    let mut detail = Map::new();
    detail.insert("connectivity_state".into(), json!(state));
    Some((points, detail))
}

fn score_congestion(props: &Map<String, Value>) -> Option<(f64, Map<String, Value>)> {
    let channel_util = get_f64(props, "channel_util").map(|v| clamp(v, 0.0, 100.0));
    let air_util_tx = get_f64(props, "air_util_tx").map(|v| clamp(v, 0.0, 100.0));
    let mut detail = Map::new();

    let utilization = match (channel_util, air_util_tx) {
        (Some(cu), Some(at)) => {
            detail.insert("channel_util".into(), json!(cu));
            detail.insert("air_util_tx".into(), json!(at));
            (cu + at) / 2.0
        }
        (Some(cu), None) => {
            detail.insert("channel_util".into(), json!(cu));
            cu
        }
        (None, Some(at)) => {
            detail.insert("air_util_tx".into(), json!(at));
            at
        }
        (None, None) => return None,
    };
    // Lower utilization is better
    let points = linear_score(
        CHANNEL_UTIL_HIGH - utilization,
        0.0,
        CHANNEL_UTIL_HIGH - CHANNEL_UTIL_LOW,
        WEIGHT_CONGESTION,
    );
    Some((points, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn full_marks_node() {
        let scorer = NodeHealthScorer::default();
        let now = 10_000.0;
        let score = scorer.score_node(
            "!a1",
            &props(&[
                ("battery", json!(95)),
                ("voltage", json!(4.1)),
                ("snr", json!(10.0)),
                ("hops_away", json!(0)),
                ("last_seen", json!(now - 60.0)),
                ("channel_util", json!(5.0)),
                ("air_util_tx", json!(2.0)),
            ]),
            Some("stable"),
            Some(now),
        );
        assert_eq!(score.score, 100);
        assert_eq!(score.status, "excellent");
        assert_eq!(score.available_weight, 100.0);
        assert_eq!(score.components.len(), 5);
    }

    #[test]
    fn missing_components_normalize() {
        let scorer = NodeHealthScorer::default();
        let now = 10_000.0;
        // Battery full (25/25) + fresh (20/20): 45/45 -> 100
        let score = scorer.score_node(
            "!a1",
            &props(&[("battery", json!(90)), ("last_seen", json!(now - 10.0))]),
            None,
            Some(now),
        );
        assert_eq!(score.available_weight, 45.0);
        assert_eq!(score.score, 100);

        // Battery floor + fresh: 20/45 -> 44
        let score = scorer.score_node(
            "!a2",
            &props(&[("battery", json!(10)), ("last_seen", json!(now - 10.0))]),
            None,
            Some(now),
        );
        assert_eq!(score.score, 44);
        assert_eq!(score.status, "fair");
    }

    #[test]
    fn score_matches_earned_over_available() {
        let scorer = NodeHealthScorer::default();
        let now = 50_000.0;
        let score = scorer.score_node(
            "!a1",
            &props(&[
                ("battery", json!(50)),
                ("snr", json!(-1.0)),
                ("last_seen", json!(now - 1800.0)),
            ]),
            Some("intermittent"),
            Some(now),
        );
        let earned: f64 = score
            .components
            .values()
            .filter_map(|c| c.get("score").and_then(Value::as_f64))
            .sum();
        let expected = (earned / score.available_weight * 100.0).round() as i64;
        assert!((score.score - expected).abs() <= 1);
        assert!((0..=100).contains(&score.score));
    }

    #[test]
    fn no_inputs_scores_zero() {
        let scorer = NodeHealthScorer::default();
        let score = scorer.score_node("!a1", &Map::new(), None, Some(1000.0));
        assert_eq!(score.score, 0);
        assert_eq!(score.available_weight, 0.0);
        assert_eq!(score.status, "critical");
    }

    #[test]
    fn negative_age_clamped() {
        let scorer = NodeHealthScorer::default();
        let now = 1000.0;
        let score = scorer.score_node(
            "!a1",
            &props(&[("last_seen", json!(now + 500.0))]),
            None,
            Some(now),
        );
        assert_eq!(score.components["freshness"]["age_seconds"], json!(0));
        assert_eq!(score.score, 100);
    }

    #[test]
    fn reliability_state_mapping() {
        assert_eq!(score_reliability(Some("stable")).unwrap().0, 15.0);
        assert_eq!(score_reliability(Some("new")).unwrap().0, 10.5);
        assert_eq!(score_reliability(Some("intermittent")).unwrap().0, 4.5);
        assert_eq!(score_reliability(Some("offline")).unwrap().0, 0.0);
        assert_eq!(score_reliability(Some("weird")).unwrap().0, 7.5);
        assert!(score_reliability(None).is_none());
    }

    #[test]
    fn congestion_averages_both_metrics() {
        // 25% and 75% average to 50%: half credit
        let (points, _) = score_congestion(&props(&[
            ("channel_util", json!(25.0)),
            ("air_util_tx", json!(75.0)),
        ]))
        .unwrap();
        assert!((points - 7.5).abs() < 1e-9);
    }

    #[test]
    fn eviction_by_oldest_timestamp() {
        let scorer = NodeHealthScorer::new(2);
        scorer.score_node("!old", &Map::new(), Some("stable"), Some(1000.0));
        scorer.score_node("!mid", &Map::new(), Some("stable"), Some(2000.0));
        scorer.score_node("!new", &Map::new(), Some("stable"), Some(3000.0));
        assert_eq!(scorer.scored_node_count(), 2);
        assert!(scorer.get_node_score("!old").is_none());
        assert!(scorer.get_node_score("!new").is_some());
    }

    #[test]
    fn all_scores_map_by_node() {
        let scorer = NodeHealthScorer::default();
        scorer.score_node("!a1", &props(&[("battery", json!(90))]), None, Some(1000.0));
        scorer.score_node("!a2", &props(&[("battery", json!(10))]), None, Some(1000.0));
        let scores = scorer.get_all_scores();
        assert_eq!(scores["!a1"], json!(100));
        assert_eq!(scores["!a2"], json!(0));
    }

    #[test]
    fn summary_aggregates() {
        let scorer = NodeHealthScorer::default();
        let now = 10_000.0;
        scorer.score_node(
            "!a1",
            &props(&[("battery", json!(90)), ("last_seen", json!(now - 10.0))]),
            None,
            Some(now),
        );
        scorer.score_node("!a2", &props(&[("battery", json!(10))]), None, Some(now));
        let summary = scorer.get_summary();
        assert_eq!(summary["scored_nodes"], json!(2));
        assert_eq!(summary["min_score"], json!(0));
        assert_eq!(summary["max_score"], json!(100));
    }
}
