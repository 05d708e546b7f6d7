//! Historical analytics.
//!
//! Read-only time-series aggregation over the node history store and the
//! alert engine. Bucket widths are clamped to [60, 86400] seconds and the
//! number of returned buckets is capped. When a backing store is missing
//! the methods return an empty result carrying an `error` field.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::alert_engine::AlertEngine;
use crate::clock::now_epoch;
use crate::node_history::NodeHistoryStore;

pub const DEFAULT_BUCKET_SECONDS: i64 = 3600;
pub const MAX_BUCKETS: usize = 720;

pub struct HistoricalAnalytics {
    history: Option<Arc<NodeHistoryStore>>,
    alert_engine: Option<Arc<AlertEngine>>,
}

fn clamp_bucket(bucket_seconds: i64) -> i64 {
    bucket_seconds.clamp(60, 86_400)
}

impl HistoricalAnalytics {
    pub fn new(
        history: Option<Arc<NodeHistoryStore>>,
        alert_engine: Option<Arc<AlertEngine>>,
    ) -> Self {
        Self {
            history,
            alert_engine,
        }
    }

    /// Unique-node and observation counts per time bucket.
    pub fn network_growth(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        bucket_seconds: i64,
    ) -> Value {
        let Some(history) = self.history.as_ref().filter(|h| h.is_available()) else {
            return json!({"buckets": [], "error": "Node history not available"});
        };

        let now = now_epoch();
        let until = until.unwrap_or(now);
        let since = since.unwrap_or(until - 24 * 3600);
        let bucket_seconds = clamp_bucket(bucket_seconds);

        let rows = history.growth_buckets(since, until, bucket_seconds);
        let buckets: Vec<Value> = rows
            .into_iter()
            .take(MAX_BUCKETS)
            .map(|(ts, nodes, obs)| {
                json!({"timestamp": ts, "unique_nodes": nodes, "observations": obs})
            })
            .collect();

        let total_buckets = buckets.len();
        json!({
            "buckets": buckets,
            "bucket_seconds": bucket_seconds,
            "since": since,
            "until": until,
            "total_buckets": total_buckets,
        })
    }

    /// Observation counts by hour of day (24 entries) plus the peak hour.
    pub fn activity_heatmap(&self, since: Option<i64>, until: Option<i64>) -> Value {
        let Some(history) = self.history.as_ref().filter(|h| h.is_available()) else {
            return json!({"hours": vec![0; 24], "error": "Node history not available"});
        };

        let now = now_epoch();
        let until = until.unwrap_or(now);
        let since = since.unwrap_or(until - 7 * 24 * 3600);
        let hours = history.hourly_histogram(since, until);

        let max = hours.iter().copied().max().unwrap_or(0);
        let peak_hour = if max > 0 {
            hours.iter().position(|&h| h == max)
        } else {
            None
        };

        json!({
            "hours": hours.to_vec(),
            "since": since,
            "until": until,
            "peak_hour": peak_hour,
            "total_observations": hours.iter().sum::<i64>(),
        })
    }

    /// Top nodes by observation count within the window.
    pub fn node_activity_ranking(&self, since: Option<i64>, limit: usize) -> Value {
        let Some(history) = self.history.as_ref().filter(|h| h.is_available()) else {
            return json!({"nodes": [], "error": "Node history not available"});
        };
        let since = since.unwrap_or(now_epoch() - 24 * 3600);
        let nodes = history.activity_ranking(since, limit);
        let count = nodes.len();
        json!({
            "nodes": nodes,
            "since": since,
            "count": count,
        })
    }

    /// High-level totals plus a per-network breakdown.
    pub fn network_summary(&self, since: Option<i64>) -> Value {
        let Some(history) = self.history.as_ref().filter(|h| h.is_available()) else {
            return json!({"error": "Node history not available"});
        };
        let now = now_epoch();
        let since = since.unwrap_or(now - 24 * 3600);

        let (unique_nodes, total_obs) = history.network_totals(since);
        let mut networks = Map::new();
        for (network, node_count, obs_count) in history.network_breakdown(since) {
            networks.insert(
                network,
                json!({"node_count": node_count, "observation_count": obs_count}),
            );
        }

        let avg_per_node = if unique_nodes > 0 {
            json!(((total_obs as f64 / unique_nodes as f64) * 10.0).round() / 10.0)
        } else {
            json!(0)
        };
        json!({
            "unique_nodes": unique_nodes,
            "total_observations": total_obs,
            "avg_observations_per_node": avg_per_node,
            "networks": networks,
            "since": since,
            "until": now,
        })
    }

    /// Alert history grouped into time buckets by severity.
    pub fn alert_trends(&self, bucket_seconds: i64, limit: usize) -> Value {
        let Some(engine) = &self.alert_engine else {
            return json!({"buckets": [], "error": "Alert engine not available"});
        };
        let bucket_seconds = clamp_bucket(bucket_seconds);
        let alerts = engine.get_alert_history(500, None, None);
        if alerts.is_empty() {
            return json!({"buckets": [], "total_alerts": 0});
        }

        let mut bucket_map: BTreeMap<i64, (u64, u64, u64)> = BTreeMap::new();
        for alert in &alerts {
            let ts = alert.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0) as i64;
            let key = (ts / bucket_seconds) * bucket_seconds;
            let slot = bucket_map.entry(key).or_insert((0, 0, 0));
            match alert.get("severity").and_then(Value::as_str) {
                Some("critical") => slot.0 += 1,
                Some("warning") => slot.1 += 1,
                _ => slot.2 += 1,
            }
        }

        let limit = limit.min(MAX_BUCKETS);
        let skip = bucket_map.len().saturating_sub(limit);
        let buckets: Vec<Value> = bucket_map
            .into_iter()
            .skip(skip)
            .map(|(ts, (critical, warning, info))| {
                json!({
                    "timestamp": ts,
                    "critical": critical,
                    "warning": warning,
                    "info": info,
                    "total": critical + warning + info,
                })
            })
            .collect();

        let total_buckets = buckets.len();
        json!({
            "buckets": buckets,
            "bucket_seconds": bucket_seconds,
            "total_alerts": alerts.len(),
            "total_buckets": total_buckets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_history::Observation;

    fn seeded_history() -> Arc<NodeHistoryStore> {
        let store = Arc::new(NodeHistoryStore::open_in_memory(0, 30 * 24 * 3600));
        for (node, ts) in [("!a1", 100), ("!b2", 200), ("!a1", 3700), ("!a1", 3800)] {
            store.record_observation(&Observation {
                node_id: node.to_string(),
                timestamp: Some(ts),
                latitude: 40.0,
                longitude: -105.0,
                network: Some("meshtastic".into()),
                ..Default::default()
            });
        }
        store
    }

    #[test]
    fn growth_buckets_shape() {
        let analytics = HistoricalAnalytics::new(Some(seeded_history()), None);
        let growth = analytics.network_growth(Some(0), Some(10_000), 3600);
        let buckets = growth["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["unique_nodes"], json!(2));
        assert_eq!(buckets[1]["observations"], json!(2));
        assert_eq!(growth["bucket_seconds"], json!(3600));
    }

    #[test]
    fn bucket_width_clamped() {
        let analytics = HistoricalAnalytics::new(Some(seeded_history()), None);
        let growth = analytics.network_growth(Some(0), Some(10_000), 5);
        assert_eq!(growth["bucket_seconds"], json!(60));
        let growth = analytics.network_growth(Some(0), Some(10_000), 1_000_000);
        assert_eq!(growth["bucket_seconds"], json!(86_400));
    }

    #[test]
    fn heatmap_counts_hours() {
        let analytics = HistoricalAnalytics::new(Some(seeded_history()), None);
        let heatmap = analytics.activity_heatmap(Some(0), Some(10_000));
        let hours = heatmap["hours"].as_array().unwrap();
        assert_eq!(hours.len(), 24);
        assert_eq!(hours[0], json!(2)); // ts 100, 200
        assert_eq!(hours[1], json!(2)); // ts 3700, 3800
        assert_eq!(heatmap["total_observations"], json!(4));
        assert!(heatmap["peak_hour"].is_number());
    }

    #[test]
    fn ranking_and_summary() {
        let analytics = HistoricalAnalytics::new(Some(seeded_history()), None);
        let ranking = analytics.node_activity_ranking(Some(0), 10);
        let nodes = ranking["nodes"].as_array().unwrap();
        assert_eq!(nodes[0]["node_id"], json!("!a1"));
        assert_eq!(nodes[0]["observation_count"], json!(3));

        let summary = analytics.network_summary(Some(0));
        assert_eq!(summary["unique_nodes"], json!(2));
        assert_eq!(summary["total_observations"], json!(4));
        assert_eq!(summary["networks"]["meshtastic"]["node_count"], json!(2));
        assert_eq!(summary["avg_observations_per_node"], json!(2.0));
    }

    #[test]
    fn missing_backends_return_error_fields() {
        let analytics = HistoricalAnalytics::new(None, None);
        assert!(analytics.network_growth(None, None, 3600)["error"].is_string());
        assert!(analytics.activity_heatmap(None, None)["error"].is_string());
        assert!(analytics.node_activity_ranking(None, 10)["error"].is_string());
        assert!(analytics.network_summary(None)["error"].is_string());
        assert!(analytics.alert_trends(3600, 10)["error"].is_string());
    }

    #[test]
    fn alert_trends_bucket_by_severity() {
        let engine = Arc::new(AlertEngine::default());
        let mut props = Map::new();
        props.insert("battery".into(), json!(3));
        engine.evaluate_node("!x", &props, None, Some(1000.0));
        engine.evaluate_node("!y", &props, None, Some(5000.0));

        let analytics = HistoricalAnalytics::new(None, Some(engine));
        let trends = analytics.alert_trends(3600, 100);
        let buckets = trends["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        // Each evaluate fired one warning (battery_low) and one critical
        assert_eq!(buckets[0]["critical"], json!(1));
        assert_eq!(buckets[0]["warning"], json!(1));
        assert_eq!(buckets[0]["total"], json!(2));
        assert_eq!(trends["total_alerts"], json!(4));
    }
}
