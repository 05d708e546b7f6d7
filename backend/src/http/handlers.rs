//! REST handlers.
//!
//! Handlers read everything through the typed [`ServerContext`]. Input
//! validation is strict for path segments (node ids must match the
//! Meshtastic id shape) and tolerant for query parameters (missing, empty,
//! or unparseable values fall back to defaults).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use crate::health_score::score_label;
use crate::node_history::MAX_TRAJECTORY_POINTS;
use crate::node_state::NodeState;

use super::ServerContext;

type Ctx = State<Arc<ServerContext>>;
type Params = Query<HashMap<String, String>>;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn bad_request(message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, message)
}

// Tolerant query accessors: absent, empty, or malformed values become None.
fn q_i64(params: &HashMap<String, String>, key: &str) -> Option<i64> {
    params.get(key).filter(|v| !v.is_empty())?.parse().ok()
}

fn q_f64(params: &HashMap<String, String>, key: &str) -> Option<f64> {
    params.get(key).filter(|v| !v.is_empty())?.parse().ok()
}

fn q_usize(params: &HashMap<String, String>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn q_str<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn require_node_id(name: &str) -> Result<(), Response> {
    if mesh_wire::is_valid_node_id(name) {
        Ok(())
    } else {
        Err(bad_request("invalid node id"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Json(value).into_response(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error"),
    }
}

// ── Node data ─────────────────────────────────────────────────────────────────

pub async fn nodes_geojson(State(ctx): Ctx) -> Response {
    let fc = ctx.aggregator.collect_all().await;
    to_json(&fc)
}

pub async fn nodes_source(State(ctx): Ctx, Path(name): Path<String>) -> Response {
    match ctx.aggregator.collect_source(&name).await {
        Some(fc) => to_json(&fc),
        None => not_found("unknown source"),
    }
}

pub async fn node_trajectory(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Query(params): Params,
) -> Response {
    if let Err(resp) = require_node_id(&name) {
        return resp;
    }
    let fc = ctx.monitor.history.get_trajectory_geojson(
        &name,
        q_i64(&params, "since"),
        q_i64(&params, "until"),
        q_usize(&params, "limit", MAX_TRAJECTORY_POINTS),
    );
    to_json(&fc)
}

pub async fn node_history(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Query(params): Params,
) -> Response {
    if let Err(resp) = require_node_id(&name) {
        return resp;
    }
    let rows = ctx.monitor.history.get_node_history(
        &name,
        q_i64(&params, "since"),
        q_usize(&params, "limit", 100),
    );
    Json(json!({"node_id": name, "observations": rows})).into_response()
}

// ── Topology + overlay ────────────────────────────────────────────────────────

pub async fn topology(State(ctx): Ctx) -> Response {
    let links = ctx.aggregator.get_topology_links();
    Json(json!({"links": links, "link_count": links.len()})).into_response()
}

pub async fn topology_geojson(State(ctx): Ctx) -> Response {
    to_json(&ctx.aggregator.get_topology_geojson())
}

pub async fn overlay(State(ctx): Ctx) -> Response {
    Json(Value::Object(ctx.aggregator.get_cached_overlay().await)).into_response()
}

pub async fn snapshot(State(ctx): Ctx, Path(ts): Path<String>) -> Response {
    let Ok(timestamp) = ts.parse::<i64>() else {
        return bad_request("invalid snapshot timestamp");
    };
    to_json(&ctx.monitor.history.get_snapshot(timestamp))
}

// ── Alerts ────────────────────────────────────────────────────────────────────

pub async fn alerts(State(ctx): Ctx, Query(params): Params) -> Response {
    let alerts = ctx.monitor.alert_engine.get_alert_history(
        q_usize(&params, "limit", 50),
        q_str(&params, "severity"),
        q_str(&params, "node_id"),
    );
    Json(json!({"alerts": alerts, "count": alerts.len()})).into_response()
}

pub async fn alerts_active(State(ctx): Ctx) -> Response {
    let alerts = ctx.monitor.alert_engine.get_active_alerts();
    Json(json!({"alerts": alerts, "count": alerts.len()})).into_response()
}

pub async fn alerts_summary(State(ctx): Ctx) -> Response {
    Json(ctx.monitor.alert_engine.get_summary()).into_response()
}

pub async fn alert_rules(State(ctx): Ctx) -> Response {
    let rules = ctx.monitor.alert_engine.list_rules();
    Json(json!({"rules": rules, "count": rules.len()})).into_response()
}

pub async fn alert_acknowledge(State(ctx): Ctx, Path(name): Path<String>) -> Response {
    if ctx.monitor.alert_engine.acknowledge(&name) {
        Json(json!({"acknowledged": name})).into_response()
    } else {
        not_found("unknown alert id")
    }
}

// ── Node analytics ────────────────────────────────────────────────────────────

pub async fn node_health(State(ctx): Ctx, Query(params): Params) -> Response {
    if let Some(node_id) = q_str(&params, "node") {
        return match ctx.monitor.health_scorer.get_node_score(node_id) {
            Some(score) => Json(score).into_response(),
            None => not_found("node not scored"),
        };
    }
    let nodes = ctx.monitor.health_scorer.get_all_details();
    Json(json!({"nodes": nodes, "count": nodes.len()})).into_response()
}

pub async fn node_health_summary(State(ctx): Ctx) -> Response {
    Json(ctx.monitor.health_scorer.get_summary()).into_response()
}

pub async fn node_states(State(ctx): Ctx, Query(params): Params) -> Response {
    if let Some(node_id) = q_str(&params, "node") {
        return match ctx.monitor.state_tracker.get_node_info(node_id) {
            Some(info) => Json(info).into_response(),
            None => not_found("node not tracked"),
        };
    }
    if let Some(state) = q_str(&params, "state") {
        let state = match state {
            "new" => NodeState::New,
            "stable" => NodeState::Stable,
            "intermittent" => NodeState::Intermittent,
            "offline" => NodeState::Offline,
            _ => return bad_request("unknown connectivity state"),
        };
        let nodes = ctx.monitor.state_tracker.get_nodes_by_state(state);
        return Json(json!({"nodes": nodes, "count": nodes.len()})).into_response();
    }
    let states = ctx.monitor.state_tracker.get_all_states();
    let count = states.len();
    Json(json!({"states": states, "count": count})).into_response()
}

/// All nodes known to the history DB with observation counts.
pub async fn tracked_nodes(State(ctx): Ctx) -> Response {
    let nodes = ctx.monitor.history.get_tracked_nodes();
    Json(json!({"nodes": nodes, "count": nodes.len()})).into_response()
}

pub async fn node_states_summary(State(ctx): Ctx) -> Response {
    Json(ctx.monitor.state_tracker.get_summary()).into_response()
}

pub async fn config_drift(State(ctx): Ctx, Query(params): Params) -> Response {
    let drifts = ctx
        .monitor
        .drift_detector
        .get_all_drifts(q_f64(&params, "since"), q_str(&params, "severity"));
    Json(json!({"drifts": drifts, "count": drifts.len()})).into_response()
}

pub async fn config_drift_summary(State(ctx): Ctx) -> Response {
    Json(ctx.monitor.drift_detector.get_summary()).into_response()
}

// ── Historical analytics ──────────────────────────────────────────────────────

pub async fn analytics_growth(State(ctx): Ctx, Query(params): Params) -> Response {
    Json(ctx.analytics.network_growth(
        q_i64(&params, "since"),
        q_i64(&params, "until"),
        q_i64(&params, "bucket").unwrap_or(crate::analytics::DEFAULT_BUCKET_SECONDS),
    ))
    .into_response()
}

pub async fn analytics_heatmap(State(ctx): Ctx, Query(params): Params) -> Response {
    Json(
        ctx.analytics
            .activity_heatmap(q_i64(&params, "since"), q_i64(&params, "until")),
    )
    .into_response()
}

pub async fn analytics_ranking(State(ctx): Ctx, Query(params): Params) -> Response {
    Json(
        ctx.analytics
            .node_activity_ranking(q_i64(&params, "since"), q_usize(&params, "limit", 50)),
    )
    .into_response()
}

pub async fn analytics_summary(State(ctx): Ctx, Query(params): Params) -> Response {
    Json(ctx.analytics.network_summary(q_i64(&params, "since"))).into_response()
}

pub async fn analytics_alert_trends(State(ctx): Ctx, Query(params): Params) -> Response {
    Json(ctx.analytics.alert_trends(
        q_i64(&params, "bucket").unwrap_or(crate::analytics::DEFAULT_BUCKET_SECONDS),
        q_usize(&params, "limit", 200),
    ))
    .into_response()
}

pub async fn analytics_density(State(ctx): Ctx, Query(params): Params) -> Response {
    let precision = q_usize(&params, "precision", 4).min(8) as u32;
    let points = ctx.monitor.history.get_density_points(
        precision,
        q_i64(&params, "since"),
        q_i64(&params, "until"),
        q_str(&params, "network"),
    );
    let rows: Vec<Value> = points
        .iter()
        .map(|(lat, lon, count)| json!([lat, lon, count]))
        .collect();
    Json(json!({"points": rows, "count": rows.len(), "precision": precision})).into_response()
}

// ── Exports ───────────────────────────────────────────────────────────────────

fn csv_field(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

fn csv_response(header: &str, rows: Vec<Vec<Value>>) -> Response {
    let mut body = String::from(header);
    body.push('\n');
    for row in rows {
        let line: Vec<String> = row.iter().map(csv_field).collect();
        body.push_str(&line.join(","));
        body.push('\n');
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
        .into_response()
}

pub async fn export_nodes(State(ctx): Ctx, Query(params): Params) -> Response {
    let fc = ctx.aggregator.collect_all().await;
    if q_str(&params, "format") == Some("json") {
        return to_json(&fc);
    }
    let rows: Vec<Vec<Value>> = fc
        .features
        .iter()
        .filter_map(|f| {
            let coords = f.geometry.get("coordinates")?.as_array()?;
            let p = &f.properties;
            Some(vec![
                p.get("id").cloned().unwrap_or(Value::Null),
                p.get("name").cloned().unwrap_or(Value::Null),
                p.get("network").cloned().unwrap_or(Value::Null),
                coords.get(1).cloned().unwrap_or(Value::Null),
                coords.first().cloned().unwrap_or(Value::Null),
                p.get("battery").cloned().unwrap_or(Value::Null),
                p.get("snr").cloned().unwrap_or(Value::Null),
                p.get("last_seen").cloned().unwrap_or(Value::Null),
                p.get("is_online").cloned().unwrap_or(Value::Null),
            ])
        })
        .collect();
    csv_response(
        "id,name,network,latitude,longitude,battery,snr,last_seen,is_online",
        rows,
    )
}

pub async fn export_alerts(State(ctx): Ctx, Query(params): Params) -> Response {
    let alerts = ctx.monitor.alert_engine.get_alert_history(
        q_usize(&params, "limit", 500),
        q_str(&params, "severity"),
        None,
    );
    if q_str(&params, "format") == Some("json") {
        return Json(json!({"alerts": alerts})).into_response();
    }
    let rows: Vec<Vec<Value>> = alerts
        .iter()
        .map(|a| {
            [
                "alert_id", "rule_id", "alert_type", "severity", "node_id", "metric", "value",
                "threshold", "timestamp", "acknowledged",
            ]
            .iter()
            .map(|key| a.get(*key).cloned().unwrap_or(Value::Null))
            .collect()
        })
        .collect();
    csv_response(
        "alert_id,rule_id,alert_type,severity,node_id,metric,value,threshold,timestamp,acknowledged",
        rows,
    )
}

pub async fn export_history(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Query(params): Params,
) -> Response {
    if let Err(resp) = require_node_id(&name) {
        return resp;
    }
    let rows = ctx.monitor.history.get_node_history(
        &name,
        q_i64(&params, "since"),
        q_usize(&params, "limit", 1000),
    );
    if q_str(&params, "format") == Some("json") {
        return Json(json!({"node_id": name, "observations": rows})).into_response();
    }
    let csv_rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|r| {
            ["timestamp", "latitude", "longitude", "altitude", "network", "snr", "battery", "name"]
                .iter()
                .map(|key| r.get(*key).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    csv_response(
        "timestamp,latitude,longitude,altitude,network,snr,battery,name",
        csv_rows,
    )
}

// ── Service ───────────────────────────────────────────────────────────────────

pub async fn config(State(ctx): Ctx) -> Response {
    let mut value = ctx.config.to_public_value();
    if let Value::Object(map) = &mut value {
        map.insert("network_colors".into(), crate::config::network_colors());
        if let Some(ws) = ctx.ws() {
            map.insert("ws_port".into(), json!(ws.port()));
        }
    }
    Json(value).into_response()
}

pub async fn tile_providers(State(_ctx): Ctx) -> Response {
    Json(crate::config::tile_providers()).into_response()
}

pub async fn sources(State(ctx): Ctx) -> Response {
    Json(json!({
        "sources": ctx.config.get_enabled_sources(),
        "network_colors": crate::config::network_colors(),
    }))
    .into_response()
}

/// HamClock-specific data, flattened from the collector's overlay output.
pub async fn hamclock(State(ctx): Ctx) -> Response {
    let Some(fc) = ctx.aggregator.collect_source("hamclock").await else {
        return not_found("HamClock source not enabled");
    };
    let props = &fc.properties;
    let mut result = Map::new();
    if let Some(Value::Object(hamclock)) = props.get("hamclock") {
        for (k, v) in hamclock {
            result.insert(k.clone(), v.clone());
        }
    }
    for key in ["space_weather", "solar_terminator"] {
        if let Some(v) = props.get(key) {
            result.insert(key.to_string(), v.clone());
        }
    }
    Json(Value::Object(result)).into_response()
}

pub async fn status(State(ctx): Ctx) -> Response {
    let aggregator = &ctx.aggregator;
    let data_age = aggregator.last_collect_age_seconds();
    let cache_ttl = ctx.config.cache_ttl_seconds();
    // Data older than twice the cache TTL is considered stale
    let data_stale = data_age.map(|age| age > cache_ttl * 2.0).unwrap_or(false);

    let ws_stats = ctx.ws().map(|ws| Value::Object(ws.stats()));

    Json(json!({
        "status": "ok",
        "service": "meshforge-maps",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.uptime_seconds(),
        "sources": ctx.config.get_enabled_sources(),
        "source_counts": aggregator.last_collect_counts(),
        "source_health": aggregator.get_source_health(),
        "mqtt_live": aggregator.mqtt_status(),
        "mqtt_node_count": aggregator.mqtt_node_count(),
        "data_age_seconds": data_age.map(|age| age as i64),
        "data_stale": data_stale,
        "circuit_breakers": aggregator.get_circuit_breaker_states(),
        "connection_gates": ctx.gates.stats(),
        "event_bus": aggregator.bus().stats(),
        "websocket": ws_stats,
        "performance": aggregator.perf().stats(),
        "history": {
            "available": ctx.monitor.history.is_available(),
            "observation_count": ctx.monitor.history.observation_count(),
            "node_count": ctx.monitor.history.node_count(),
        },
    }))
    .into_response()
}

/// Composite server health: weighted components normalized over what is
/// actually measurable, mirroring the per-node scorer's shape.
pub async fn server_health(State(ctx): Ctx) -> Response {
    let aggregator = &ctx.aggregator;
    let mut components = Map::new();
    let mut earned = 0.0;
    let mut available = 0.0;

    // Data freshness (30): full when fresh, partial when stale
    let cache_ttl = ctx.config.cache_ttl_seconds();
    let freshness = match aggregator.last_collect_age_seconds() {
        Some(age) if age <= cache_ttl * 2.0 => 30.0,
        Some(_) => 10.0,
        None => 0.0,
    };
    components.insert("data_freshness".into(), json!({"score": freshness, "max": 30.0}));
    earned += freshness;
    available += 30.0;

    // Circuit breakers (30): fraction of sources with a closed circuit
    let breakers = aggregator.get_circuit_breaker_states();
    let source_score = if breakers.is_empty() {
        30.0
    } else {
        let closed = breakers
            .values()
            .filter(|b| b.get("state").and_then(Value::as_str) == Some("closed"))
            .count();
        30.0 * closed as f64 / breakers.len() as f64
    };
    components.insert("sources".into(), json!({"score": source_score, "max": 30.0}));
    earned += source_score;
    available += 30.0;

    // History store (20)
    let history_score = if ctx.monitor.history.is_available() { 20.0 } else { 0.0 };
    components.insert("history".into(), json!({"score": history_score, "max": 20.0}));
    earned += history_score;
    available += 20.0;

    // WebSocket (10): optional surface
    let ws_score = if ctx.ws().is_some() { 10.0 } else { 0.0 };
    components.insert("websocket".into(), json!({"score": ws_score, "max": 10.0}));
    earned += ws_score;
    available += 10.0;

    // MQTT (10): only counted when the subscriber is enabled
    match aggregator.mqtt_status() {
        "disabled" => {}
        state => {
            let mqtt_score = if state == "connected" { 10.0 } else { 0.0 };
            components.insert("mqtt".into(), json!({"score": mqtt_score, "max": 10.0}));
            earned += mqtt_score;
            available += 10.0;
        }
    }

    let score = if available > 0.0 {
        ((earned / available) * 100.0).round() as i64
    } else {
        0
    };
    Json(json!({
        "score": score,
        "status": score_label(score),
        "components": components,
        "available_weight": available,
    }))
    .into_response()
}
