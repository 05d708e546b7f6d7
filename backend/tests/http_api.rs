//! End-to-end tests for the REST surface.
//!
//! Builds the real router over a stack with every collector disabled and
//! an in-memory history DB, then drives it with tower's `oneshot` — no
//! sockets, no upstream services.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Map, Value};
use tower::ServiceExt;

use meshforge_maps_backend::aggregator::DataAggregator;
use meshforge_maps_backend::analytics::HistoricalAnalytics;
use meshforge_maps_backend::config::MapsConfig;
use meshforge_maps_backend::connection_gate::GateRegistry;
use meshforge_maps_backend::event_bus::EventBus;
use meshforge_maps_backend::http::{build_router, ServerContext};
use meshforge_maps_backend::monitor::NodeMonitor;
use meshforge_maps_backend::node_history::{NodeHistoryStore, Observation};

struct TestStack {
    router: Router,
    monitor: Arc<NodeMonitor>,
}

fn test_stack() -> TestStack {
    let config: MapsConfig = serde_json::from_value(json!({
        "enable_meshtastic": false,
        "enable_reticulum": false,
        "enable_hamclock": false,
        "enable_aredn": false,
        "enable_noaa_alerts": false,
        "mqtt_username": "op",
        "mqtt_password": "secret",
    }))
    .expect("test config");

    let bus = Arc::new(EventBus::new());
    let gates = Arc::new(GateRegistry::new());
    let history = Arc::new(NodeHistoryStore::open_in_memory(0, 30 * 24 * 3600));
    let monitor = NodeMonitor::new(Arc::clone(&bus), Arc::clone(&history));
    let aggregator = Arc::new(DataAggregator::new(&config, Arc::clone(&bus), &gates));
    let analytics = HistoricalAnalytics::new(
        Some(Arc::clone(&history)),
        Some(Arc::clone(&monitor.alert_engine)),
    );

    let ctx = Arc::new(ServerContext::new(
        aggregator,
        config,
        Arc::clone(&monitor),
        analytics,
        gates,
        PathBuf::from("does-not-exist"),
    ));
    TestStack {
        router: build_router(ctx),
        monitor,
    }
}

async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
    request(router, Method::GET, path).await
}

async fn request(router: &Router, method: Method, path: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(path)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 22)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn status_reports_service_state_and_common_headers() {
    let stack = test_stack();
    let response = stack
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache");
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    assert_eq!(headers.get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 22).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["mqtt_live"], json!("disabled"));
    assert_eq!(body["data_stale"], json!(false));
    assert_eq!(body["history"]["available"], json!(true));
    assert!(body["event_bus"]["total_published"].is_number());
}

#[tokio::test]
async fn options_preflight_returns_204_with_cors() {
    let stack = test_stack();
    let response = stack
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/nodes/geojson")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
    assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
}

#[tokio::test]
async fn aggregated_geojson_is_a_feature_collection() {
    let stack = test_stack();
    let (status, body) = get(&stack.router, "/api/nodes/geojson").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], json!("FeatureCollection"));
    assert_eq!(body["features"], json!([]));
    assert_eq!(body["properties"]["total_nodes"], json!(0));
}

#[tokio::test]
async fn unknown_source_is_404() {
    let stack = test_stack();
    let (status, body) = get(&stack.router, "/api/nodes/nosuchsource").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn invalid_node_id_is_400() {
    let stack = test_stack();
    let (status, _) = get(&stack.router, "/api/nodes/not-a-node-id/trajectory").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&stack.router, "/api/nodes/gg/history").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&stack.router, "/api/snapshot/yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn trajectory_round_trip_through_history() {
    let stack = test_stack();
    for (ts, lat, lon) in [(1000, 40.0, -105.0), (2000, 40.1, -105.1), (3000, 40.2, -105.2)] {
        stack.monitor.history.record_observation(&Observation {
            node_id: "!a1b2c3d4".into(),
            timestamp: Some(ts),
            latitude: lat,
            longitude: lon,
            network: Some("meshtastic".into()),
            ..Default::default()
        });
    }

    let (status, body) = get(&stack.router, "/api/nodes/!a1b2c3d4/trajectory").await;
    assert_eq!(status, StatusCode::OK);
    let feature = &body["features"][0];
    assert_eq!(feature["geometry"]["type"], json!("LineString"));
    assert_eq!(
        feature["geometry"]["coordinates"],
        json!([[-105.0, 40.0], [-105.1, 40.1], [-105.2, 40.2]])
    );

    let (status, body) = get(&stack.router, "/api/nodes/!a1b2c3d4/history?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["observations"].as_array().unwrap().len(), 2);

    let (_, body) = get(&stack.router, "/api/snapshot/2500").await;
    assert_eq!(body["features"].as_array().unwrap().len(), 1);
    assert_eq!(body["features"][0]["geometry"]["coordinates"], json!([-105.1, 40.1]));

    let (_, body) = get(&stack.router, "/api/history/nodes").await;
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["nodes"][0]["observation_count"], json!(3));
}

#[tokio::test]
async fn alert_lifecycle_over_http() {
    let stack = test_stack();
    let mut props = Map::new();
    props.insert("battery".into(), json!(3));
    stack
        .monitor
        .alert_engine
        .evaluate_node("!a1b2c3d4", &props, None, Some(1000.0));

    let (status, body) = get(&stack.router, "/api/alerts/active").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(2));

    let alert_id = body["alerts"][0]["alert_id"].as_str().unwrap().to_string();
    let (status, _) = request(
        &stack.router,
        Method::POST,
        &format!("/api/alerts/{alert_id}/acknowledge"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get(&stack.router, "/api/alerts/active").await;
    assert_eq!(body["count"], json!(1));

    let (status, _) = request(&stack.router, Method::POST, "/api/alerts/alert-999/acknowledge").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = get(&stack.router, "/api/alerts/summary").await;
    assert_eq!(body["total_alerts_fired"], json!(2));
    let (_, body) = get(&stack.router, "/api/alerts/rules").await;
    assert_eq!(body["count"], json!(5));
}

#[tokio::test]
async fn analytics_endpoints_respond() {
    let stack = test_stack();
    stack.monitor.history.record_observation(&Observation {
        node_id: "!0a0b0c0d".into(),
        timestamp: Some(1000),
        latitude: 40.0,
        longitude: -105.0,
        network: Some("meshtastic".into()),
        ..Default::default()
    });

    let (status, body) = get(&stack.router, "/api/analytics/growth?since=0&until=10000").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_buckets"], json!(1));

    let (_, body) = get(&stack.router, "/api/analytics/summary?since=0").await;
    assert_eq!(body["unique_nodes"], json!(1));

    let (_, body) = get(&stack.router, "/api/analytics/heatmap?since=0&until=10000").await;
    assert_eq!(body["total_observations"], json!(1));

    let (_, body) = get(&stack.router, "/api/analytics/density?since=0&precision=3").await;
    assert_eq!(body["count"], json!(1));

    // Bad query values fall back to defaults rather than erroring
    let (status, _) = get(&stack.router, "/api/analytics/growth?since=banana&bucket=").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn node_state_and_drift_surfaces() {
    let stack = test_stack();
    let (status, body) = get(&stack.router, "/api/node-states/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tracked_nodes"], json!(0));

    stack.monitor.state_tracker.record_heartbeat("!a1b2c3d4", Some(1000.0));
    let (_, body) = get(&stack.router, "/api/node-states?state=new").await;
    assert_eq!(body["count"], json!(1));
    let (status, _) = get(&stack.router, "/api/node-states?state=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut fields = Map::new();
    fields.insert("role".into(), json!("CLIENT"));
    stack.monitor.drift_detector.check_node("!a1", &fields);
    let mut fields = Map::new();
    fields.insert("role".into(), json!("ROUTER"));
    stack.monitor.drift_detector.check_node("!a1", &fields);

    let (_, body) = get(&stack.router, "/api/config-drift").await;
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["drifts"][0]["field"], json!("role"));
    let (_, body) = get(&stack.router, "/api/config-drift?severity=critical").await;
    assert_eq!(body["count"], json!(0));
    let (_, body) = get(&stack.router, "/api/config-drift/summary").await;
    assert_eq!(body["total_drifts"], json!(1));
}

#[tokio::test]
async fn config_hides_credentials_and_lists_sources() {
    let stack = test_stack();
    let (_, body) = get(&stack.router, "/api/config").await;
    assert!(body.get("mqtt_username").is_none());
    assert!(body.get("mqtt_password").is_none());
    assert!(body["network_colors"]["meshtastic"].is_string());

    let (_, body) = get(&stack.router, "/api/sources").await;
    assert_eq!(body["sources"], json!([]));

    let (_, body) = get(&stack.router, "/api/tile-providers").await;
    assert!(body["carto_dark"]["url"].is_string());
}

#[tokio::test]
async fn server_health_composite_score() {
    let stack = test_stack();
    let (status, body) = get(&stack.router, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    let score = body["score"].as_i64().unwrap();
    assert!((0..=100).contains(&score));
    assert!(body["components"]["history"]["score"].as_f64().unwrap() > 0.0);
    assert!(body["status"].is_string());
}

#[tokio::test]
async fn csv_export_has_rows() {
    let stack = test_stack();
    let mut props = Map::new();
    props.insert("battery".into(), json!(3));
    stack
        .monitor
        .alert_engine
        .evaluate_node("!a1b2c3d4", &props, None, Some(1000.0));

    let response = stack
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/export/alerts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 22).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<&str> = body.trim().lines().collect();
    assert_eq!(lines.len(), 3); // header + two alerts
    assert!(lines[0].starts_with("alert_id,rule_id,alert_type"));
}

#[tokio::test]
async fn hamclock_endpoint_404_when_disabled() {
    let stack = test_stack();
    let (status, _) = get(&stack.router, "/api/hamclock").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
