//! Process orchestrator.
//!
//! Lifecycle: load config → build the shared infrastructure (bus, gates,
//! history, monitor) → build the aggregator (starts MQTT when enabled) →
//! start HTTP with port fallback → start WebSocket on the adjacent port →
//! run the background collection and maintenance loops until ctrl-c, then
//! shut everything down in reverse order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use meshforge_maps_backend::aggregator::DataAggregator;
use meshforge_maps_backend::analytics::HistoricalAnalytics;
use meshforge_maps_backend::config::{data_dir, default_config_path, MapsConfig};
use meshforge_maps_backend::connection_gate::GateRegistry;
use meshforge_maps_backend::event_bus::EventBus;
use meshforge_maps_backend::http::{HttpServer, ServerContext};
use meshforge_maps_backend::monitor::NodeMonitor;
use meshforge_maps_backend::node_history::{
    NodeHistoryStore, DEFAULT_RETENTION_SECONDS, DEFAULT_THROTTLE_SECONDS,
};
use meshforge_maps_backend::ws_server::{WsServer, DEFAULT_HISTORY_SIZE};

#[derive(Parser)]
#[command(name = "meshforge-maps", version, about = "Mesh network telemetry map server")]
struct Cli {
    /// Bind address for the HTTP and WebSocket servers
    #[arg(long)]
    host: Option<String>,

    /// HTTP port (the WebSocket server uses the adjacent port)
    #[arg(long)]
    port: Option<u16>,

    /// Launch the terminal dashboard
    #[arg(long)]
    tui: bool,

    /// Terminal dashboard only, without the web map server
    #[arg(long)]
    tui_only: bool,

    /// Settings file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshforge_maps=info,meshforge_maps_backend=info".into()),
        )
        .init();

    if cli.tui || cli.tui_only {
        warn!("the terminal dashboard is not available in this build");
        if cli.tui_only {
            return;
        }
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = MapsConfig::load(&config_path);
    if let Some(host) = cli.host {
        config.http_host = host.clone();
        config.ws_host = host;
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    info!(
        "MeshForge Maps v{} starting — sources: {:?}",
        env!("CARGO_PKG_VERSION"),
        config.get_enabled_sources()
    );

    // Shared infrastructure
    let bus = Arc::new(EventBus::new());
    let gates = Arc::new(GateRegistry::new());
    let history = Arc::new(NodeHistoryStore::open(
        &data_dir().join("maps_node_history.db"),
        DEFAULT_THROTTLE_SECONDS,
        DEFAULT_RETENTION_SECONDS,
    ));
    let monitor = NodeMonitor::new(Arc::clone(&bus), Arc::clone(&history));

    // Aggregator owns the collectors and the MQTT subscription
    let aggregator = Arc::new(DataAggregator::new(&config, Arc::clone(&bus), &gates));
    aggregator.start();

    // Store evictions fan out to the connectivity/drift/health trackers
    if let Some(store) = aggregator.mqtt_store() {
        let monitor_removals = Arc::clone(&monitor);
        store.set_removal_callback(move |node_id| monitor_removals.handle_node_removed(node_id));
    }

    let analytics = HistoricalAnalytics::new(
        Some(Arc::clone(&history)),
        Some(Arc::clone(&monitor.alert_engine)),
    );
    let web_dir = std::env::var_os("MESHFORGE_MAPS_WEB_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("web"));
    let ctx = Arc::new(ServerContext::new(
        Arc::clone(&aggregator),
        config.clone(),
        Arc::clone(&monitor),
        analytics,
        Arc::clone(&gates),
        web_dir,
    ));

    // HTTP with port fallback; no free port is fatal
    let Some(http) = HttpServer::start(Arc::clone(&ctx), &config.http_host, config.http_port).await
    else {
        error!("failed to start map server — check port availability");
        std::process::exit(1);
    };

    // WebSocket on the adjacent port, bridged to the bus. Optional:
    // clients fall back to polling when it is unavailable.
    let ws = WsServer::start(&config.ws_host, http.port() + 1, DEFAULT_HISTORY_SIZE).await;
    if let Some(ws) = &ws {
        ctx.set_ws(Arc::clone(ws));
        let bridge = Arc::clone(ws);
        bus.subscribe(None, move |event| bridge.broadcast(&event.to_wire()));
    } else {
        info!("continuing without WebSocket updates");
    }

    // Background collection loop: refresh sources and feed the monitor
    let collect_secs = (config.cache_ttl_minutes * 60).max(60);
    let collect_task = {
        let aggregator = Arc::clone(&aggregator);
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(collect_secs));
            loop {
                interval.tick().await;
                let fc = aggregator.collect_all().await;
                monitor.ingest_collection(&fc);
            }
        })
    };

    // Maintenance loop: offline scans, stale-node cleanup, history pruning
    let maintenance_task = {
        let monitor = Arc::clone(&monitor);
        let store = aggregator.mqtt_store();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                monitor.run_maintenance();
                if let Some(store) = &store {
                    store.cleanup_stale_nodes();
                }
            }
        })
    };

    info!(
        "MeshForge Maps running at http://{}:{}",
        config.http_host,
        http.port()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutting down");

    collect_task.abort();
    maintenance_task.abort();
    if let Some(ws) = &ws {
        ws.shutdown();
    }
    http.shutdown().await;
    aggregator.shutdown().await;
    history.close();
    info!("shutdown complete");
}
