//! Threshold-based alerting.
//!
//! Evaluates configurable rules against node telemetry and health data.
//! Cooldown throttling per `(node, rule)` prevents alert storms; history is
//! bounded; every fired alert is also published on the event bus as
//! `alert.fired` for WebSocket delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::clock::now_secs;
use crate::event_bus::{Event, EventBus};

pub const MAX_ALERT_HISTORY: usize = 500;
pub const DEFAULT_COOLDOWN: f64 = 600.0;

const COOLDOWN_MAX_AGE: f64 = 86_400.0;
const COOLDOWN_CLEANUP_INTERVAL: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Lt,
    Gt,
    Eq,
    Lte,
    Gte,
}

impl Operator {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Gt => value > threshold,
            Self::Eq => value == threshold,
            Self::Lte => value <= threshold,
            Self::Gte => value >= threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    pub cooldown: f64,
    pub enabled: bool,
    pub network_filter: Option<String>,
    pub description: String,
}

impl AlertRule {
    fn new(
        rule_id: &str,
        alert_type: &str,
        severity: AlertSeverity,
        metric: &str,
        operator: Operator,
        threshold: f64,
        description: &str,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            alert_type: alert_type.to_string(),
            severity,
            metric: metric.to_string(),
            operator,
            threshold,
            cooldown: DEFAULT_COOLDOWN,
            enabled: true,
            network_filter: None,
            description: description.to_string(),
        }
    }
}

/// Built-in rules for the common mesh failure modes.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "battery_low",
            "battery_low",
            AlertSeverity::Warning,
            "battery",
            Operator::Lte,
            20.0,
            "Battery level is low (<=20%)",
        ),
        AlertRule::new(
            "battery_critical",
            "battery_critical",
            AlertSeverity::Critical,
            "battery",
            Operator::Lte,
            5.0,
            "Battery level is critical (<=5%)",
        ),
        AlertRule::new(
            "signal_poor",
            "signal_poor",
            AlertSeverity::Warning,
            "snr",
            Operator::Lte,
            -10.0,
            "Signal quality is poor (SNR <= -10 dB)",
        ),
        AlertRule::new(
            "congestion_high",
            "congestion_high",
            AlertSeverity::Warning,
            "channel_util",
            Operator::Gte,
            75.0,
            "Channel utilization is high (>=75%)",
        ),
        AlertRule::new(
            "health_degraded",
            "health_degraded",
            AlertSeverity::Warning,
            "health_score",
            Operator::Lte,
            20.0,
            "Node health score is critical (<=20)",
        ),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_id: String,
    pub alert_type: String,
    pub severity: String,
    pub node_id: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub timestamp: f64,
    pub acknowledged: bool,
}

impl Alert {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn to_map(&self) -> Map<String, Value> {
        match self.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

struct EngineState {
    rules: HashMap<String, AlertRule>,
    history: VecDeque<Alert>,
    // "node_id:rule_id" -> last fire time
    cooldowns: HashMap<String, f64>,
    alert_counter: u64,
    total_alerts_fired: u64,
    last_cooldown_cleanup: f64,
}

pub struct AlertEngine {
    state: Mutex<EngineState>,
    max_history: usize,
    bus: Option<Arc<EventBus>>,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(None, MAX_ALERT_HISTORY, None)
    }
}

impl AlertEngine {
    pub fn new(rules: Option<Vec<AlertRule>>, max_history: usize, bus: Option<Arc<EventBus>>) -> Self {
        let rules = rules.unwrap_or_else(default_rules);
        Self {
            state: Mutex::new(EngineState {
                rules: rules.into_iter().map(|r| (r.rule_id.clone(), r)).collect(),
                history: VecDeque::new(),
                cooldowns: HashMap::new(),
                alert_counter: 0,
                total_alerts_fired: 0,
                last_cooldown_cleanup: 0.0,
            }),
            max_history,
            bus,
        }
    }

    // ── Rule management ──────────────────────────────────────────────────

    pub fn add_rule(&self, rule: AlertRule) {
        let mut state = self.state.lock().unwrap();
        state.rules.insert(rule.rule_id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.state.lock().unwrap().rules.remove(rule_id).is_some()
    }

    pub fn list_rules(&self) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        let mut rules: Vec<&AlertRule> = state.rules.values().collect();
        rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        rules
            .into_iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect()
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.rules.get_mut(rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    // ── Evaluation ───────────────────────────────────────────────────────

    /// Evaluate all enabled rules against a node's properties merged with
    /// its health score. Returns the alerts that fired this call.
    pub fn evaluate_node(
        &self,
        node_id: &str,
        props: &Map<String, Value>,
        health_score: Option<i64>,
        now: Option<f64>,
    ) -> Vec<Alert> {
        let now = now.unwrap_or_else(now_secs);
        self.maybe_cleanup_cooldowns(now);

        let network = props.get("network").and_then(Value::as_str).map(str::to_string);
        let rules: Vec<AlertRule> = {
            let state = self.state.lock().unwrap();
            state.rules.values().cloned().collect()
        };

        let mut triggered = Vec::new();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if let Some(filter) = &rule.network_filter {
                if network.as_deref() != Some(filter.as_str()) {
                    continue;
                }
            }

            let value = if rule.metric == "health_score" {
                health_score.map(|s| s as f64)
            } else {
                match props.get(&rule.metric) {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => s.trim().parse().ok(),
                    _ => None,
                }
            };
            let Some(value) = value.filter(|v| v.is_finite()) else {
                continue;
            };
            if !rule.operator.evaluate(value, rule.threshold) {
                continue;
            }

            if let Some(alert) = self.fire(node_id, &rule, value, now) {
                triggered.push(alert);
            }
        }

        self.publish(&triggered);
        triggered
    }

    /// Offline detection is driven by absence, not by properties, so it is
    /// a separate entry point fed from the connectivity tracker.
    pub fn evaluate_offline(
        &self,
        node_id: &str,
        last_seen: f64,
        offline_threshold: f64,
        now: Option<f64>,
    ) -> Option<Alert> {
        let now = now.unwrap_or_else(now_secs);
        let age = now - last_seen;
        if age <= offline_threshold {
            return None;
        }

        let rule = AlertRule {
            cooldown: DEFAULT_COOLDOWN,
            ..AlertRule::new(
                "node_offline",
                "node_offline",
                AlertSeverity::Critical,
                "seconds_since_seen",
                Operator::Gt,
                offline_threshold,
                "Node is offline",
            )
        };
        let alert = self.fire_with_message(
            node_id,
            &rule,
            age,
            now,
            format!("Node {node_id} offline — last seen {}s ago", age as i64),
        )?;
        self.publish(std::slice::from_ref(&alert));
        Some(alert)
    }

    fn fire(&self, node_id: &str, rule: &AlertRule, value: f64, now: f64) -> Option<Alert> {
        let message = format!("{} — node {node_id}: {}={value}", rule.description, rule.metric);
        self.fire_with_message(node_id, rule, value, now, message)
    }

    fn fire_with_message(
        &self,
        node_id: &str,
        rule: &AlertRule,
        value: f64,
        now: f64,
        message: String,
    ) -> Option<Alert> {
        let mut state = self.state.lock().unwrap();
        let cooldown_key = format!("{node_id}:{}", rule.rule_id);
        let last_fired = state.cooldowns.get(&cooldown_key).copied().unwrap_or(0.0);
        if now - last_fired < rule.cooldown {
            return None;
        }

        state.alert_counter += 1;
        let alert = Alert {
            alert_id: format!("alert-{}", state.alert_counter),
            rule_id: rule.rule_id.clone(),
            alert_type: rule.alert_type.clone(),
            severity: rule.severity.as_str().to_string(),
            node_id: node_id.to_string(),
            metric: rule.metric.clone(),
            value,
            threshold: rule.threshold,
            message,
            timestamp: now,
            acknowledged: false,
        };
        state.cooldowns.insert(cooldown_key, now);
        state.history.push_back(alert.clone());
        state.total_alerts_fired += 1;
        while state.history.len() > self.max_history {
            state.history.pop_front();
        }
        Some(alert)
    }

    fn publish(&self, alerts: &[Alert]) {
        if let Some(bus) = &self.bus {
            for alert in alerts {
                bus.publish(&Event::alert_fired(alert.to_map()));
            }
        }
    }

    fn maybe_cleanup_cooldowns(&self, now: f64) {
        let mut state = self.state.lock().unwrap();
        if now - state.last_cooldown_cleanup <= COOLDOWN_CLEANUP_INTERVAL {
            return;
        }
        state.cooldowns.retain(|_, fired| now - *fired <= COOLDOWN_MAX_AGE);
        state.last_cooldown_cleanup = now;
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        for alert in state.history.iter_mut() {
            if alert.alert_id == alert_id {
                alert.acknowledged = true;
                return true;
            }
        }
        false
    }

    pub fn get_active_alerts(&self) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .filter(|a| !a.acknowledged)
            .map(Alert::to_value)
            .collect()
    }

    /// Recent alerts, newest first, with optional filters.
    pub fn get_alert_history(
        &self,
        limit: usize,
        severity: Option<&str>,
        node_id: Option<&str>,
    ) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .rev()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .filter(|a| node_id.map_or(true, |n| a.node_id == n))
            .take(limit)
            .map(Alert::to_value)
            .collect()
    }

    pub fn get_summary(&self) -> Value {
        let state = self.state.lock().unwrap();
        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        let mut active = 0u64;
        for alert in &state.history {
            if !alert.acknowledged {
                active += 1;
                *by_severity.entry(alert.severity.clone()).or_insert(0) += 1;
                *by_type.entry(alert.alert_type.clone()).or_insert(0) += 1;
            }
        }
        json!({
            "total_rules": state.rules.len(),
            "enabled_rules": state.rules.values().filter(|r| r.enabled).count(),
            "total_alerts_fired": state.total_alerts_fired,
            "active_alerts": active,
            "history_size": state.history.len(),
            "by_severity": by_severity,
            "by_type": by_type,
        })
    }

    pub fn clear_cooldowns(&self) {
        self.state.lock().unwrap().cooldowns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn battery_alerts_fire_with_cooldown() {
        let engine = AlertEngine::default();
        let first = engine.evaluate_node("!x", &props(&[("battery", json!(3))]), None, Some(1000.0));
        let mut types: Vec<&str> = first.iter().map(|a| a.alert_type.as_str()).collect();
        types.sort();
        assert_eq!(types, vec!["battery_critical", "battery_low"]);

        // Inside the cooldown window: nothing fires
        let second = engine.evaluate_node("!x", &props(&[("battery", json!(3))]), None, Some(1100.0));
        assert!(second.is_empty());

        // Past the 600s cooldown: both fire again
        let third = engine.evaluate_node("!x", &props(&[("battery", json!(3))]), None, Some(1601.0));
        assert_eq!(third.len(), 2);

        // Consecutive fires for the same rule are at least cooldown apart
        let history = engine.get_alert_history(100, None, None);
        let lows: Vec<f64> = history
            .iter()
            .filter(|a| a["rule_id"] == json!("battery_low"))
            .filter_map(|a| a["timestamp"].as_f64())
            .collect();
        assert_eq!(lows.len(), 2);
        assert!((lows[0] - lows[1]).abs() >= DEFAULT_COOLDOWN);
    }

    #[test]
    fn health_score_rule_uses_merged_context() {
        let engine = AlertEngine::default();
        let alerts = engine.evaluate_node("!x", &Map::new(), Some(15), Some(1000.0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "health_degraded");
        assert_eq!(alerts[0].value, 15.0);
    }

    #[test]
    fn non_numeric_and_missing_metrics_skipped() {
        let engine = AlertEngine::default();
        let alerts = engine.evaluate_node(
            "!x",
            &props(&[("battery", json!("plenty")), ("snr", Value::Null)]),
            None,
            Some(1000.0),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn network_filter_restricts_rule() {
        let mut rule = AlertRule::new(
            "aredn_battery",
            "battery_low",
            AlertSeverity::Warning,
            "battery",
            Operator::Lte,
            50.0,
            "test",
        );
        rule.network_filter = Some("aredn".into());
        let engine = AlertEngine::new(Some(vec![rule]), 100, None);

        let meshtastic = engine.evaluate_node(
            "!x",
            &props(&[("battery", json!(40)), ("network", json!("meshtastic"))]),
            None,
            Some(1000.0),
        );
        assert!(meshtastic.is_empty());

        let aredn = engine.evaluate_node(
            "node1",
            &props(&[("battery", json!(40)), ("network", json!("aredn"))]),
            None,
            Some(1000.0),
        );
        assert_eq!(aredn.len(), 1);
    }

    #[test]
    fn offline_alert_with_cooldown() {
        let engine = AlertEngine::default();
        let alert = engine.evaluate_offline("!x", 1000.0, 3600.0, Some(5000.0)).unwrap();
        assert_eq!(alert.alert_type, "node_offline");
        assert_eq!(alert.severity, "critical");
        assert_eq!(alert.value, 4000.0);
        // Within cooldown
        assert!(engine.evaluate_offline("!x", 1000.0, 3600.0, Some(5100.0)).is_none());
        // Not actually offline
        assert!(engine.evaluate_offline("!y", 4990.0, 3600.0, Some(5000.0)).is_none());
    }

    #[test]
    fn acknowledge_and_active_filtering() {
        let engine = AlertEngine::default();
        let alerts = engine.evaluate_node("!x", &props(&[("battery", json!(3))]), None, Some(1000.0));
        assert_eq!(engine.get_active_alerts().len(), 2);
        assert!(engine.acknowledge(&alerts[0].alert_id));
        assert!(!engine.acknowledge("alert-does-not-exist"));
        assert_eq!(engine.get_active_alerts().len(), 1);
        // History keeps acknowledged alerts
        assert_eq!(engine.get_alert_history(100, None, None).len(), 2);
    }

    #[test]
    fn history_bounded_and_filtered() {
        let engine = AlertEngine::new(None, 5, None);
        for i in 0..10 {
            engine.clear_cooldowns();
            engine.evaluate_node(
                &format!("!n{i}"),
                &props(&[("snr", json!(-20))]),
                None,
                Some(1000.0 + i as f64),
            );
        }
        let history = engine.get_alert_history(100, None, None);
        assert_eq!(history.len(), 5);
        // Newest first
        assert_eq!(history[0]["node_id"], json!("!n9"));
        let one = engine.get_alert_history(100, Some("warning"), Some("!n7"));
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn alert_ids_increase_monotonically() {
        let engine = AlertEngine::default();
        engine.evaluate_node("!a", &props(&[("battery", json!(3))]), None, Some(1000.0));
        engine.evaluate_node("!b", &props(&[("battery", json!(3))]), None, Some(1000.0));
        let history = engine.get_alert_history(100, None, None);
        let ids: Vec<&str> = history.iter().filter_map(|a| a["alert_id"].as_str()).collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.contains(&"alert-1") && ids.contains(&"alert-4"));
    }

    #[test]
    fn fired_alerts_published_to_bus() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        bus.subscribe(Some(EventType::AlertFired), move |ev| {
            assert!(ev.data.get("alert_id").is_some());
            assert_eq!(ev.data["node_id"], json!("!x"));
            s.fetch_add(1, Ordering::SeqCst);
        });
        let engine = AlertEngine::new(None, 100, Some(Arc::clone(&bus)));
        engine.evaluate_node("!x", &props(&[("battery", json!(3))]), None, Some(1000.0));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rule_management() {
        let engine = AlertEngine::default();
        assert_eq!(engine.list_rules().len(), 5);
        assert!(engine.set_rule_enabled("battery_low", false));
        let alerts = engine.evaluate_node("!x", &props(&[("battery", json!(10))]), None, Some(1000.0));
        assert!(alerts.is_empty());
        assert!(engine.remove_rule("battery_low"));
        assert!(!engine.remove_rule("battery_low"));
        assert_eq!(engine.get_summary()["total_rules"], json!(4));
    }
}
