//! # mesh-sim
//!
//! Publishes synthetic Meshtastic JSON traffic to an MQTT broker so the
//! maps backend can be developed and demoed without live radios. Frames go
//! out on the same topic shape the firmware uses
//! (`msh/<region>/2/json/<channel>/<node_id>`).
//!
//! Point it at a local broker:
//!     mesh-sim --broker localhost --nodes 12 --interval 5

mod nodes;

use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use nodes::SimNode;

#[derive(Parser)]
#[command(name = "mesh-sim", version, about = "Synthetic Meshtastic MQTT publisher")]
struct Cli {
    /// MQTT broker hostname
    #[arg(long, default_value = "localhost")]
    broker: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Topic root (region prefix)
    #[arg(long, default_value = "msh/US")]
    topic: String,

    /// Channel name used in the topic path
    #[arg(long, default_value = "LongFast")]
    channel: String,

    /// Number of simulated nodes
    #[arg(long, default_value_t = 8)]
    nodes: usize,

    /// Seconds between publish rounds
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Center latitude for the simulated cluster
    #[arg(long, default_value_t = 40.015)]
    lat: f64,

    /// Center longitude for the simulated cluster
    #[arg(long, default_value_t = -105.27)]
    lon: f64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_sim=info".into()),
        )
        .init();

    info!(
        "mesh-sim: {} nodes -> mqtt://{}:{} every {}s",
        cli.nodes, cli.broker, cli.port, cli.interval
    );

    let mut options = MqttOptions::new(
        format!("mesh-sim-{}", std::process::id()),
        &cli.broker,
        cli.port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    // Drain the event loop in the background; publish failures surface on
    // the publish side
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                warn!("mqtt event loop error: {e} — reconnecting");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    });

    let mut sim_nodes: Vec<SimNode> = (0..cli.nodes as u64)
        .map(|i| SimNode::new(i, cli.lat, cli.lon, 0.05))
        .collect();
    let all_nums: Vec<u64> = sim_nodes.iter().map(|n| n.num).collect();

    let mut interval = tokio::time::interval(Duration::from_secs(cli.interval.max(1)));
    loop {
        interval.tick().await;
        let mut published = 0usize;
        for node in &mut sim_nodes {
            let topic = format!("{}/2/json/{}/{}", cli.topic, cli.channel, node.node_id);
            for frame in node.tick(&all_nums) {
                if let Err(e) = client
                    .publish(&topic, QoS::AtMostOnce, false, frame.to_string())
                    .await
                {
                    warn!("publish failed: {e}");
                } else {
                    published += 1;
                }
            }
        }
        info!("published {published} frames for {} nodes", sim_nodes.len());
    }
}
