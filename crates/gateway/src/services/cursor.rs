//! Cursor service: live position sharing with ingress throttling and TTL
//! expiry.
//!
//! Updates are rate limited per client; excess updates are silently
//! dropped. Entries expire after [`CURSOR_TTL`] and a sweeper broadcasts a
//! `remove` event exactly once per expiry. Cursor broadcasts deliberately
//! do not exclude the sender; the echo doubles as a delivery confirmation.

use super::{parse_data, validate_channel_name, Service};
use crate::protocol::{now_iso, ServerFrame};
use crate::registry::ClientId;
use crate::router::MessageRouter;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Minimum spacing between broadcast updates from one client.
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(250);

/// Cursor entries expire after this long without an update.
pub const CURSOR_TTL: Duration = Duration::from_secs(30);

/// Sweeper cadence.
pub const CURSOR_CLEANUP: Duration = Duration::from_secs(10);

/// Position interpretation modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    #[default]
    Freeform,
    Table,
    Text,
    Canvas,
}

/// One client's cursor in one channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorEntry {
    pub client_id: ClientId,
    pub mode: CursorMode,
    pub position: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateData {
    channel: String,
    #[serde(default)]
    mode: CursorMode,
    position: Value,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    channel: String,
}

/// Check the position object against its mode's expected shape.
fn validate_position(mode: CursorMode, position: &Value) -> Option<String> {
    let field = |name: &str| position.get(name);
    let is_number = |name: &str| field(name).map(Value::is_number).unwrap_or(false);
    let is_uint = |name: &str| field(name).map(Value::is_u64).unwrap_or(false);

    let ok = match mode {
        CursorMode::Freeform => is_number("x") && is_number("y"),
        CursorMode::Table => is_uint("row") && is_uint("col"),
        CursorMode::Text => is_uint("position"),
        CursorMode::Canvas => {
            is_number("x")
                && is_number("y")
                && field("tool").map(Value::is_string).unwrap_or(false)
        }
    };
    if ok {
        None
    } else {
        Some("position shape mismatch".to_string())
    }
}

pub struct CursorService {
    router: Arc<MessageRouter>,
    /// channel → client → entry.
    cursors: DashMap<String, DashMap<ClientId, CursorEntry>>,
    last_update: DashMap<ClientId, Instant>,
    throttle: Duration,
    ttl: Duration,
    cleanup: Duration,
}

impl CursorService {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Self::with_timing(router, THROTTLE_INTERVAL, CURSOR_TTL, CURSOR_CLEANUP)
    }

    /// Constructor with explicit timing, used by tests.
    pub fn with_timing(
        router: Arc<MessageRouter>,
        throttle: Duration,
        ttl: Duration,
        cleanup: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            cursors: DashMap::new(),
            last_update: DashMap::new(),
            throttle,
            ttl,
            cleanup,
        })
    }

    fn throttled(&self, client_id: &ClientId) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_update.get(client_id) {
            if now.duration_since(*last) < self.throttle {
                return true;
            }
        }
        self.last_update.insert(*client_id, now);
        false
    }

    fn channel_cursors(&self, channel: &str) -> Vec<CursorEntry> {
        match self.cursors.get(channel) {
            Some(map) => map.iter().map(|entry| entry.value().clone()).collect(),
            None => Vec::new(),
        }
    }

    async fn update(&self, client_id: ClientId, data: Value) -> Option<ServerFrame> {
        let data: UpdateData = match parse_data("cursor", "update", data) {
            Ok(d) => d,
            Err(frame) => return Some(*frame),
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return Some(ServerFrame::err("cursor", "update", reason));
        }
        if let Some(reason) = validate_position(data.mode, &data.position) {
            return Some(ServerFrame::err("cursor", "update", reason));
        }
        if self.throttled(&client_id) {
            // Rate limited: dropped without a reply.
            return None;
        }

        let entry = CursorEntry {
            client_id,
            mode: data.mode,
            position: data.position,
            metadata: data.metadata,
            updated_at: Utc::now().timestamp_millis(),
        };
        self.cursors
            .entry(data.channel.clone())
            .or_default()
            .insert(client_id, entry.clone());

        let route = format!("cursor:{}", data.channel);
        let frame = json!({
            "type": "cursor",
            "action": "update",
            "channel": data.channel,
            "cursor": entry,
            "timestamp": now_iso(),
        });
        self.router.send_to_channel(&route, frame, None).await;
        None
    }

    async fn subscribe(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("cursor", "subscribe", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return ServerFrame::err("cursor", "subscribe", reason);
        }
        if let Err(e) = self
            .router
            .subscribe_to_channel(&client_id, &format!("cursor:{}", data.channel))
            .await
        {
            return ServerFrame::err("cursor", "subscribe", e.to_string());
        }
        ServerFrame::ok(
            "cursor",
            "subscribe",
            json!({"channel": data.channel, "cursors": self.channel_cursors(&data.channel)}),
        )
    }

    async fn unsubscribe(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("cursor", "unsubscribe", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        self.router
            .unsubscribe_from_channel(&client_id, &format!("cursor:{}", data.channel))
            .await;
        ServerFrame::ok("cursor", "unsubscribe", json!({"channel": data.channel}))
    }

    fn get(&self, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("cursor", "get", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        ServerFrame::ok(
            "cursor",
            "get",
            json!({"channel": data.channel, "cursors": self.channel_cursors(&data.channel)}),
        )
    }

    /// One expiry pass. Exposed for tests.
    pub async fn sweep(&self) {
        let cutoff = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;
        let mut removals: Vec<(String, ClientId)> = Vec::new();
        for channel_entry in self.cursors.iter() {
            for cursor in channel_entry.value().iter() {
                if cursor.value().updated_at < cutoff {
                    removals.push((channel_entry.key().clone(), *cursor.key()));
                }
            }
        }
        for (channel, client_id) in removals {
            let removed = self
                .cursors
                .get(&channel)
                .and_then(|map| map.remove(&client_id))
                .is_some();
            if removed {
                debug!("Cursor expired for {} in '{}'", client_id, channel);
                self.broadcast_remove(&channel, &client_id).await;
            }
        }
        self.cursors.retain(|_, map| !map.is_empty());
    }

    async fn broadcast_remove(&self, channel: &str, client_id: &ClientId) {
        let frame = json!({
            "type": "cursor",
            "action": "remove",
            "channel": channel,
            "clientId": client_id,
            "timestamp": now_iso(),
        });
        self.router
            .send_to_channel(&format!("cursor:{}", channel), frame, None)
            .await;
    }

    /// Start the background expiry sweeper.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cleanup);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[async_trait]
impl Service for CursorService {
    fn name(&self) -> &'static str {
        "cursor"
    }

    async fn handle_action(
        &self,
        client_id: ClientId,
        action: &str,
        data: Value,
    ) -> Option<ServerFrame> {
        match action {
            "update" => self.update(client_id, data).await,
            "subscribe" => Some(self.subscribe(client_id, data).await),
            "unsubscribe" => Some(self.unsubscribe(client_id, data).await),
            "get" => Some(self.get(data)),
            other => Some(ServerFrame::err(
                "cursor",
                other,
                format!("unknown action '{}'", other),
            )),
        }
    }

    async fn on_client_disconnect(&self, client_id: ClientId) {
        self.last_update.remove(&client_id);
        let mut removals: Vec<String> = Vec::new();
        for channel_entry in self.cursors.iter() {
            if channel_entry.value().remove(&client_id).is_some() {
                removals.push(channel_entry.key().clone());
            }
        }
        for channel in removals {
            self.broadcast_remove(&channel, &client_id).await;
        }
        self.cursors.retain(|_, map| !map.is_empty());
    }

    fn stats(&self) -> Value {
        let total: usize = self.cursors.iter().map(|map| map.value().len()).sum();
        json!({"channels": self.cursors.len(), "cursors": total})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeManager;
    use crate::registry::{ClientConnection, ConnectionRegistry};
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    struct Fixture {
        cursor: Arc<CursorService>,
        router: Arc<MessageRouter>,
    }

    fn fixture(throttle: Duration, ttl: Duration) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let node = Arc::new(NodeManager::new(8080, None, registry.clone()));
        let router = MessageRouter::new(node, registry, None, None);
        let cursor = CursorService::with_timing(router.clone(), throttle, ttl, Duration::from_millis(10));
        Fixture { cursor, router }
    }

    async fn connect(fx: &Fixture) -> (ClientId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let (conn, _close) = ClientConnection::new(tx, json!({}));
        let id = conn.id;
        fx.router.register_local_client(conn).await;
        (id, rx)
    }

    fn recv_json(rx: &mut mpsc::Receiver<Message>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn position_shapes() {
        assert!(validate_position(CursorMode::Freeform, &json!({"x": 1.5, "y": 2})).is_none());
        assert!(validate_position(CursorMode::Freeform, &json!({"x": 1.5})).is_some());
        assert!(validate_position(CursorMode::Table, &json!({"row": 3, "col": 4})).is_none());
        assert!(validate_position(CursorMode::Table, &json!({"row": -1, "col": 4})).is_some());
        assert!(validate_position(CursorMode::Text, &json!({"position": 42})).is_none());
        assert!(
            validate_position(CursorMode::Canvas, &json!({"x": 0, "y": 0, "tool": "pen"})).is_none()
        );
        assert!(validate_position(CursorMode::Canvas, &json!({"x": 0, "y": 0})).is_some());
    }

    #[tokio::test]
    async fn updates_are_throttled_then_allowed_again() {
        let fx = fixture(Duration::from_millis(50), CURSOR_TTL);
        let (alpha, mut rx_a) = connect(&fx).await;
        fx.cursor
            .handle_action(alpha, "subscribe", json!({"channel": "doc"}))
            .await;

        for i in 0..10 {
            let reply = fx
                .cursor
                .handle_action(
                    alpha,
                    "update",
                    json!({"channel": "doc", "position": {"x": i, "y": i}}),
                )
                .await;
            assert!(reply.is_none());
        }
        // Only the first update was broadcast; the sender sees its own echo.
        let echo = recv_json(&mut rx_a);
        assert_eq!(echo["action"], "update");
        assert_eq!(echo["cursor"]["position"]["x"], 0);
        assert!(rx_a.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        fx.cursor
            .handle_action(
                alpha,
                "update",
                json!({"channel": "doc", "position": {"x": 99, "y": 0}}),
            )
            .await;
        let later = recv_json(&mut rx_a);
        assert_eq!(later["cursor"]["position"]["x"], 99);
    }

    #[tokio::test]
    async fn bad_position_is_an_input_error() {
        let fx = fixture(THROTTLE_INTERVAL, CURSOR_TTL);
        let (alpha, _rx) = connect(&fx).await;
        let frame = fx
            .cursor
            .handle_action(
                alpha,
                "update",
                json!({"channel": "doc", "mode": "table", "position": {"x": 1, "y": 2}}),
            )
            .await
            .unwrap();
        assert_eq!(frame.success, Some(false));
        assert_eq!(frame.error.as_deref(), Some("position shape mismatch"));
    }

    #[tokio::test]
    async fn expired_cursor_is_removed_and_announced_once() {
        let fx = fixture(Duration::from_millis(1), Duration::from_millis(30));
        let (alpha, mut rx_a) = connect(&fx).await;
        fx.cursor
            .handle_action(alpha, "subscribe", json!({"channel": "doc"}))
            .await;
        fx.cursor
            .handle_action(
                alpha,
                "update",
                json!({"channel": "doc", "position": {"x": 1, "y": 1}}),
            )
            .await;
        let _ = recv_json(&mut rx_a); // the update echo

        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.cursor.sweep().await;
        fx.cursor.sweep().await;

        let removed = recv_json(&mut rx_a);
        assert_eq!(removed["action"], "remove");
        assert_eq!(removed["clientId"], alpha.to_string());
        assert!(rx_a.try_recv().is_err());

        let get = fx
            .cursor
            .handle_action(alpha, "get", json!({"channel": "doc"}))
            .await
            .unwrap();
        assert!(get.data.unwrap()["cursors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_returns_current_set() {
        let fx = fixture(Duration::from_millis(1), CURSOR_TTL);
        let (alpha, _rx_a) = connect(&fx).await;
        let (beta, _rx_b) = connect(&fx).await;

        fx.cursor
            .handle_action(
                alpha,
                "update",
                json!({"channel": "doc", "position": {"x": 5, "y": 6}}),
            )
            .await;

        let frame = fx
            .cursor
            .handle_action(beta, "subscribe", json!({"channel": "doc"}))
            .await
            .unwrap();
        let cursors = frame.data.unwrap()["cursors"].as_array().unwrap().clone();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0]["clientId"], alpha.to_string());
    }
}
