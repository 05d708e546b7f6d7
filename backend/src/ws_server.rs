//! WebSocket broadcast server for real-time map updates.
//!
//! Listens on its own port (HTTP port + 1 by convention) and pushes one
//! JSON object per message to every connected client. New clients first
//! receive the bounded history buffer, then live broadcasts. Registration
//! (with its history snapshot) and broadcast (history append + per-client
//! send scheduling) each happen inside the same critical section, so a
//! client connecting during a broadcast sees the message exactly once —
//! either in its replay or live, never both or neither.
//!
//! Connections are accepted only from allow-listed localhost origins;
//! clients without an Origin header (native tools) are let through. Client
//! messages are limited to `ping`, `get_history`, and `get_stats`;
//! malformed input is silently dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::now_secs;

pub const DEFAULT_HISTORY_SIZE: usize = 50;

const ALLOWED_ORIGIN_PREFIXES: [&str; 4] = [
    "http://localhost",
    "https://localhost",
    "http://127.0.0.1",
    "https://127.0.0.1",
];

fn origin_allowed(origin: Option<&str>) -> bool {
    match origin {
        None => true,
        Some(origin) => ALLOWED_ORIGIN_PREFIXES.iter().any(|prefix| {
            origin
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(':') || rest.starts_with('/'))
        }),
    }
}

struct WsInner {
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    history: VecDeque<String>,
}

struct WsShared {
    inner: Mutex<WsInner>,
    history_size: usize,
    next_client_id: AtomicU64,
    total_connections: AtomicU64,
    total_messages_sent: AtomicU64,
}

impl WsShared {
    fn new(history_size: usize) -> Self {
        Self {
            inner: Mutex::new(WsInner {
                clients: HashMap::new(),
                history: VecDeque::with_capacity(history_size),
            }),
            history_size,
            next_client_id: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            total_messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a client: its send queue is pre-loaded with the history
    /// replay inside the registration critical section.
    fn register_client(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().unwrap();
            for message in &inner.history {
                let _ = tx.send(message.clone());
            }
            inner.clients.insert(id, tx);
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        (id, rx)
    }

    fn remove_client(&self, id: u64) {
        self.inner.lock().unwrap().clients.remove(&id);
    }

    /// Append to history and schedule delivery to every client under one
    /// lock.
    fn broadcast_text(&self, text: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.history.len() == self.history_size {
            inner.history.pop_front();
        }
        inner.history.push_back(text.clone());
        inner.clients.retain(|_, tx| tx.send(text.clone()).is_ok());
    }

    fn history_snapshot(&self, limit: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    fn client_count(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    fn stats(&self) -> Map<String, Value> {
        let mut stats = Map::new();
        stats.insert("clients_connected".into(), json!(self.client_count()));
        stats.insert(
            "total_connections".into(),
            json!(self.total_connections.load(Ordering::Relaxed)),
        );
        stats.insert(
            "total_messages_sent".into(),
            json!(self.total_messages_sent.load(Ordering::Relaxed)),
        );
        stats.insert(
            "history_size".into(),
            json!(self.inner.lock().unwrap().history.len()),
        );
        stats
    }
}

pub struct WsServer {
    shared: Arc<WsShared>,
    port: u16,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsServer {
    /// Bind and start serving. Returns `None` when the port cannot be
    /// bound — the WebSocket surface is optional and clients fall back to
    /// polling.
    pub async fn start(host: &str, port: u16, history_size: usize) -> Option<Arc<Self>> {
        let listener = match tokio::net::TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("WebSocket server failed to bind {host}:{port}: {e}");
                return None;
            }
        };

        let shared = Arc::new(WsShared::new(history_size));
        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&shared));

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("WebSocket server exited: {e}");
            }
        });
        info!("WebSocket server listening on ws://{host}:{port}");

        Some(Arc::new(Self {
            shared,
            port,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send a JSON message to every connected client and remember it for
    /// replay. Callable from any task or bus callback.
    pub fn broadcast(&self, message: &Value) {
        self.shared.broadcast_text(message.to_string());
    }

    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }

    pub fn stats(&self) -> Map<String, Value> {
        self.shared.stats()
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.inner.lock().unwrap().clients.clear();
        info!("WebSocket server stopped");
    }
}

async fn ws_handler(
    State(shared): State<Arc<WsShared>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !origin_allowed(origin) {
        debug!("WebSocket connection rejected: origin {origin:?}");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| client_loop(shared, socket))
}

async fn client_loop(shared: Arc<WsShared>, socket: WebSocket) {
    let (client_id, mut queue) = shared.register_client();
    info!(
        "WebSocket client connected (total: {})",
        shared.client_count()
    );

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outgoing = queue.recv() => {
                let Some(text) = outgoing else { break };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
                shared.total_messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&shared, client_id, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket client error: {e}");
                        break;
                    }
                }
            }
        }
    }

    shared.remove_client(client_id);
    info!(
        "WebSocket client disconnected (total: {})",
        shared.client_count()
    );
}

/// Handle one client request. Replies go through the client's own queue so
/// they interleave correctly with broadcasts.
fn handle_client_message(shared: &WsShared, client_id: u64, raw: &str) {
    let Ok(Value::Object(data)) = serde_json::from_str::<Value>(raw) else {
        debug!("WebSocket: dropped malformed client message");
        return;
    };
    let reply = match data.get("type").and_then(Value::as_str) {
        Some("ping") => json!({"type": "pong", "timestamp": now_secs()}),
        Some("get_history") => {
            let limit = data
                .get("limit")
                .and_then(Value::as_u64)
                .map(|l| l as usize)
                .unwrap_or(DEFAULT_HISTORY_SIZE)
                .min(shared.history_size);
            json!({"type": "history", "messages": shared.history_snapshot(limit)})
        }
        Some("get_stats") => json!({"type": "stats", "data": shared.stats()}),
        _ => return,
    };

    let inner = shared.inner.lock().unwrap();
    if let Some(tx) = inner.clients.get(&client_id) {
        let _ = tx.send(reply.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_allow_list() {
        assert!(origin_allowed(None));
        assert!(origin_allowed(Some("http://localhost:8808")));
        assert!(origin_allowed(Some("https://127.0.0.1:9000")));
        assert!(!origin_allowed(Some("http://evil.example.com")));
        assert!(!origin_allowed(Some("http://localhost.evil.com")));
    }

    #[test]
    fn history_replay_then_live_exactly_once() {
        let shared = WsShared::new(10);
        shared.broadcast_text("a".into());
        shared.broadcast_text("b".into());

        let (_id, mut queue) = shared.register_client();
        shared.broadcast_text("c".into());

        // Replay first, then the live broadcast; "c" arrives exactly once
        assert_eq!(queue.try_recv().unwrap(), "a");
        assert_eq!(queue.try_recv().unwrap(), "b");
        assert_eq!(queue.try_recv().unwrap(), "c");
        assert!(queue.try_recv().is_err());
    }

    #[test]
    fn history_bounded() {
        let shared = WsShared::new(3);
        for i in 0..5 {
            shared.broadcast_text(format!("m{i}"));
        }
        assert_eq!(shared.history_snapshot(10), vec!["m2", "m3", "m4"]);
        assert_eq!(shared.history_snapshot(2), vec!["m3", "m4"]);
    }

    #[test]
    fn disconnected_clients_pruned_on_broadcast() {
        let shared = WsShared::new(10);
        let (_id, queue) = shared.register_client();
        assert_eq!(shared.client_count(), 1);
        drop(queue);
        shared.broadcast_text("x".into());
        assert_eq!(shared.client_count(), 0);
    }

    #[test]
    fn client_messages_validated() {
        let shared = WsShared::new(10);
        let (id, mut queue) = shared.register_client();

        handle_client_message(&shared, id, "not json");
        handle_client_message(&shared, id, "{\"type\": \"subscribe\"}");
        assert!(queue.try_recv().is_err());

        handle_client_message(&shared, id, "{\"type\": \"ping\"}");
        let reply: Value = serde_json::from_str(&queue.try_recv().unwrap()).unwrap();
        assert_eq!(reply["type"], json!("pong"));

        shared.broadcast_text("past".into());
        handle_client_message(&shared, id, "{\"type\": \"get_history\", \"limit\": 5}");
        // First the broadcast, then the history reply
        assert_eq!(queue.try_recv().unwrap(), "past");
        let reply: Value = serde_json::from_str(&queue.try_recv().unwrap()).unwrap();
        assert_eq!(reply["type"], json!("history"));
        assert_eq!(reply["messages"], json!(["past"]));
    }

    #[tokio::test]
    async fn server_binds_and_reports_stats() {
        let server = WsServer::start("127.0.0.1", 0, 10).await;
        // Port 0 binds to an ephemeral port; server must come up
        let server = server.unwrap();
        let stats = server.stats();
        assert_eq!(stats["clients_connected"], json!(0));
        server.shutdown();
    }
}
