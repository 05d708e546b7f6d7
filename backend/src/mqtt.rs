//! Live MQTT subscriber for the Meshtastic network.
//!
//! Connects to the configured broker (public `mqtt.meshtastic.org` by
//! default, private brokers supported via username/password) and subscribes
//! to the `msh/#` topic tree. Messages are the firmware's JSON output —
//! `position`, `nodeinfo`, `telemetry`, and `neighborinfo` frames — decoded
//! through the shared `mesh-wire` structs. Accepted updates mutate the node
//! store and are republished on the event bus.
//!
//! Runs as a background Tokio task with reconnect backoff; the task honors
//! a running flag and is stopped by the orchestrator on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_wire::MqttEnvelope;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::{json, Map};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event_bus::{Event, EventBus};
use crate::geojson::insert_opt;
use crate::node_store::{MqttNodeStore, Neighbor};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: mesh_wire::DEFAULT_BROKER.to_string(),
            port: mesh_wire::DEFAULT_PORT,
            topic: mesh_wire::DEFAULT_TOPIC.to_string(),
            username: None,
            password: None,
        }
    }
}

pub struct MqttSubscriber {
    settings: MqttSettings,
    store: Arc<MqttNodeStore>,
    bus: Arc<EventBus>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    client: Mutex<Option<AsyncClient>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSubscriber {
    pub fn new(settings: MqttSettings, store: Arc<MqttNodeStore>, bus: Arc<EventBus>) -> Self {
        Self {
            settings,
            store,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            client: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<MqttNodeStore> {
        Arc::clone(&self.store)
    }

    /// Spawn the subscription loop. Safe to call once; repeat calls are
    /// no-ops while running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_loop().await;
        });
        *self.task.lock().unwrap() = Some(handle);
        info!(
            "MQTT subscriber starting: {}:{} topic={}",
            self.settings.broker, self.settings.port, self.settings.topic
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("MQTT subscriber task did not exit within 5s");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("MQTT subscriber stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> &'static str {
        if !self.is_running() {
            "stopped"
        } else if self.is_connected() {
            "connected"
        } else {
            "connecting"
        }
    }

    /// Connection loop with exponential reconnect backoff (2s doubling to
    /// 60s, reset after a successful connection).
    async fn run_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(2);
        while self.running.load(Ordering::SeqCst) {
            let client_id = format!("meshforge-maps-{}", std::process::id());
            let mut options =
                MqttOptions::new(client_id, &self.settings.broker, self.settings.port);
            options.set_keep_alive(Duration::from_secs(60));
            if let (Some(user), Some(pass)) =
                (&self.settings.username, &self.settings.password)
            {
                options.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut eventloop) = AsyncClient::new(options, 64);
            *self.client.lock().unwrap() = Some(client.clone());

            loop {
                match eventloop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected to {}", self.settings.broker);
                        self.connected.store(true, Ordering::SeqCst);
                        backoff = Duration::from_secs(2);
                        if let Err(e) = client
                            .subscribe(&self.settings.topic, QoS::AtMostOnce)
                            .await
                        {
                            warn!("MQTT subscribe failed: {e}");
                        }
                        self.bus.publish(&Event::service_up("mqtt"));
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        handle_message(&self.store, &self.bus, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.connected.store(false, Ordering::SeqCst);
                        if !self.running.load(Ordering::SeqCst) {
                            return;
                        }
                        warn!(
                            "MQTT connection lost: {e}, reconnecting in {}s",
                            backoff.as_secs()
                        );
                        self.bus
                            .publish(&Event::service_down("mqtt", &e.to_string()));
                        break;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }
}

/// Decode one broker message and apply it. Unparseable payloads are very
/// common on the public broker (encrypted protobuf) and are dropped at
/// debug level.
fn handle_message(store: &MqttNodeStore, bus: &EventBus, payload: &[u8]) {
    let envelope: MqttEnvelope = match serde_json::from_slice(payload) {
        Ok(env) => env,
        Err(e) => {
            debug!("MQTT: dropped non-JSON payload: {e}");
            return;
        }
    };
    let Some(node_id) = envelope.node_id() else {
        return;
    };

    match envelope.msg_type.as_str() {
        "position" => {
            let Some(position) = envelope.position() else {
                return;
            };
            let Some((lat, lon)) = position.coordinates() else {
                return;
            };
            store.update_position(&node_id, lat, lon, position.altitude, None);
            let mut data = Map::new();
            insert_opt(&mut data, "altitude", position.altitude);
            bus.publish(&Event::position(&node_id, lat, lon, "mqtt", data));
        }
        "nodeinfo" => {
            let Some(info) = envelope.nodeinfo() else {
                return;
            };
            store.update_nodeinfo(
                &node_id,
                info.long_name.as_deref(),
                info.short_name.as_deref(),
                info.hardware.as_deref(),
                info.role.as_deref(),
            );
            let mut data = Map::new();
            insert_opt(&mut data, "name", info.long_name.clone());
            insert_opt(&mut data, "short_name", info.short_name.clone());
            insert_opt(&mut data, "hardware", info.hardware.clone());
            insert_opt(&mut data, "role", info.role.clone());
            bus.publish(&Event::info(&node_id, "mqtt", data));
        }
        "telemetry" => {
            let Some(telemetry) = envelope.telemetry() else {
                return;
            };
            let mut fields = Map::new();
            insert_opt(&mut fields, "battery", telemetry.battery_level);
            insert_opt(&mut fields, "voltage", telemetry.voltage);
            insert_opt(&mut fields, "temperature", telemetry.temperature);
            insert_opt(&mut fields, "humidity", telemetry.relative_humidity);
            insert_opt(&mut fields, "pressure", telemetry.barometric_pressure);
            insert_opt(&mut fields, "channel_util", telemetry.channel_utilization);
            insert_opt(&mut fields, "air_util_tx", telemetry.air_util_tx);
            for (key, value) in telemetry.extra {
                if !value.is_null() {
                    fields.insert(key, value);
                }
            }
            store.update_telemetry(&node_id, fields.clone());
            bus.publish(&Event::telemetry(&node_id, "mqtt", fields));
        }
        "neighborinfo" => {
            let Some(neighborinfo) = envelope.neighborinfo() else {
                return;
            };
            let neighbors: Vec<Neighbor> = neighborinfo
                .neighbors
                .iter()
                .map(|n| Neighbor {
                    node_id: mesh_wire::format_node_id(n.node_id),
                    snr: n.snr,
                })
                .collect();
            let mut data = Map::new();
            data.insert("neighbor_count".into(), json!(neighbors.len()));
            store.update_neighbors(&node_id, neighbors);
            bus.publish(&Event::topology(&node_id, "mqtt", data));
        }
        other => {
            debug!("MQTT: ignoring message type '{other}' from {node_id}");
        }
    }
}
