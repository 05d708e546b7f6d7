//! HTTP map server.
//!
//! REST surface plus static map assets, bound to loopback by default. The
//! configured port falls back across up to 4 adjacent ports when already in
//! use. Every response carries `Cache-Control: no-cache`,
//! `Access-Control-Allow-Origin: *`, and `X-Content-Type-Options: nosniff`;
//! CORS preflights answer 204. Client disconnects mid-response are handled
//! by hyper and never surface as errors.

pub mod handlers;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::aggregator::DataAggregator;
use crate::analytics::HistoricalAnalytics;
use crate::clock::now_secs;
use crate::config::MapsConfig;
use crate::connection_gate::GateRegistry;
use crate::monitor::NodeMonitor;
use crate::ws_server::WsServer;

/// Extra adjacent ports tried when the configured port is taken.
pub const PORT_FALLBACK_RANGE: u16 = 4;

/// Typed context shared by every handler.
pub struct ServerContext {
    pub aggregator: Arc<DataAggregator>,
    pub config: MapsConfig,
    pub monitor: Arc<NodeMonitor>,
    pub analytics: HistoricalAnalytics,
    pub gates: Arc<GateRegistry>,
    pub web_dir: PathBuf,
    pub start_time: f64,
    ws: Mutex<Option<Arc<WsServer>>>,
}

impl ServerContext {
    pub fn new(
        aggregator: Arc<DataAggregator>,
        config: MapsConfig,
        monitor: Arc<NodeMonitor>,
        analytics: HistoricalAnalytics,
        gates: Arc<GateRegistry>,
        web_dir: PathBuf,
    ) -> Self {
        Self {
            aggregator,
            config,
            monitor,
            analytics,
            gates,
            web_dir,
            start_time: now_secs(),
            ws: Mutex::new(None),
        }
    }

    pub fn set_ws(&self, ws: Arc<WsServer>) {
        *self.ws.lock().unwrap() = Some(ws);
    }

    pub fn ws(&self) -> Option<Arc<WsServer>> {
        self.ws.lock().unwrap().clone()
    }

    pub fn uptime_seconds(&self) -> i64 {
        (now_secs() - self.start_time) as i64
    }
}

/// Try the configured port, then adjacent ports. Returns the bound
/// listener and the port it landed on.
pub async fn bind_with_fallback(host: &str, base_port: u16) -> Option<(TcpListener, u16)> {
    let mut last_error = None;
    for offset in 0..=PORT_FALLBACK_RANGE {
        let port = base_port + offset;
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if offset > 0 {
                    warn!("port {base_port} in use, map server bound to {host}:{port}");
                }
                return Some((listener, port));
            }
            Err(e) => {
                debug!("port {port} unavailable: {e}");
                last_error = Some(e);
            }
        }
    }
    error!(
        "failed to bind map server on ports {base_port}-{}: {last_error:?}",
        base_port + PORT_FALLBACK_RANGE
    );
    None
}

pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    let static_files = ServeDir::new(&ctx.web_dir);
    Router::new()
        // node data
        .route("/api/nodes/geojson", get(handlers::nodes_geojson))
        .route("/api/nodes/all", get(handlers::nodes_geojson))
        .route("/api/nodes/:name", get(handlers::nodes_source))
        .route("/api/nodes/:name/trajectory", get(handlers::node_trajectory))
        .route("/api/nodes/:name/history", get(handlers::node_history))
        .route("/api/history/nodes", get(handlers::tracked_nodes))
        // topology + overlay
        .route("/api/topology", get(handlers::topology))
        .route("/api/topology/geojson", get(handlers::topology_geojson))
        .route("/api/overlay", get(handlers::overlay))
        .route("/api/snapshot/:ts", get(handlers::snapshot))
        // alerts
        .route("/api/alerts", get(handlers::alerts))
        .route("/api/alerts/active", get(handlers::alerts_active))
        .route("/api/alerts/summary", get(handlers::alerts_summary))
        .route("/api/alerts/rules", get(handlers::alert_rules))
        .route("/api/alerts/:name/acknowledge", post(handlers::alert_acknowledge))
        // node analytics
        .route("/api/node-health", get(handlers::node_health))
        .route("/api/node-health/summary", get(handlers::node_health_summary))
        .route("/api/node-states", get(handlers::node_states))
        .route("/api/node-states/summary", get(handlers::node_states_summary))
        .route("/api/config-drift", get(handlers::config_drift))
        .route("/api/config-drift/summary", get(handlers::config_drift_summary))
        // historical analytics
        .route("/api/analytics/growth", get(handlers::analytics_growth))
        .route("/api/analytics/heatmap", get(handlers::analytics_heatmap))
        .route("/api/analytics/ranking", get(handlers::analytics_ranking))
        .route("/api/analytics/summary", get(handlers::analytics_summary))
        .route("/api/analytics/alert-trends", get(handlers::analytics_alert_trends))
        .route("/api/analytics/density", get(handlers::analytics_density))
        // exports
        .route("/api/export/nodes", get(handlers::export_nodes))
        .route("/api/export/alerts", get(handlers::export_alerts))
        .route("/api/export/history/:name", get(handlers::export_history))
        // service
        .route("/api/config", get(handlers::config))
        .route("/api/tile-providers", get(handlers::tile_providers))
        .route("/api/sources", get(handlers::sources))
        .route("/api/hamclock", get(handlers::hamclock))
        .route("/api/status", get(handlers::status))
        .route("/api/health", get(handlers::server_health))
        // static map frontend for everything else
        .fallback_service(static_files)
        .layer(middleware::from_fn(common_headers))
        .with_state(ctx)
}

/// Shared response headers and OPTIONS preflight handling.
async fn common_headers(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Default::default());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Accept"),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("86400"),
        );
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

pub struct HttpServer {
    port: u16,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind (with port fallback) and start serving in a background task.
    /// Returns `None` when no port in the fallback window is free.
    pub async fn start(ctx: Arc<ServerContext>, host: &str, base_port: u16) -> Option<Self> {
        let (listener, port) = bind_with_fallback(host, base_port).await?;
        let app = build_router(ctx);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("map server exited: {e}");
            }
        });
        info!("map server started on http://{host}:{port}");
        Some(Self {
            port,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving; waits up to 5s for the serve task to wind down and
    /// warns on a missed join.
    pub async fn shutdown(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(_) => info!("map server stopped"),
                Err(_) => warn!("map server task did not exit within 5s"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_fallback_walks_adjacent_ports() {
        // Occupy the whole fallback window 18810-18814
        let mut held = Vec::new();
        for port in 18810..=18814u16 {
            held.push(TcpListener::bind(("127.0.0.1", port)).await.unwrap());
        }
        assert!(bind_with_fallback("127.0.0.1", 18810).await.is_none());

        // Free one port in the middle: binding succeeds exactly there
        held.remove(2); // releases 18812
        let (listener, port) = bind_with_fallback("127.0.0.1", 18810).await.unwrap();
        assert_eq!(port, 18812);
        drop(listener);
    }

    #[tokio::test]
    async fn first_port_preferred_when_free() {
        let (listener, port) = bind_with_fallback("127.0.0.1", 18820).await.unwrap();
        assert_eq!(port, 18820);
        drop(listener);
    }
}
