//! MeshForge Maps backend.
//!
//! Telemetry aggregation and real-time monitoring for amateur-radio mesh
//! networks. Pluggable collectors pull node, link, and environmental data
//! from Meshtastic (MQTT + local daemon), AREDN, Reticulum, HamClock, and
//! NOAA; the aggregation kernel normalizes everything into GeoJSON, tracks
//! per-node connectivity and health, detects configuration drift, fires
//! threshold alerts, and streams live updates to HTTP and WebSocket
//! clients.

pub mod aggregator;
pub mod alert_engine;
pub mod analytics;
pub mod circuit_breaker;
pub mod clock;
pub mod collectors;
pub mod config;
pub mod config_drift;
pub mod connection_gate;
pub mod event_bus;
pub mod geojson;
pub mod health_score;
pub mod http;
pub mod monitor;
pub mod mqtt;
pub mod node_history;
pub mod node_state;
pub mod node_store;
pub mod perf_monitor;
pub mod ws_server;
