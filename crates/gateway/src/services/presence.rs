//! Presence service: per-client status with heartbeat-driven liveness.
//!
//! Presence state is node-local. A background sweeper transitions clients
//! to `offline` exactly once when their last heartbeat is older than the
//! timeout; every transition is published on `presence:<channel>` for each
//! channel the client is associated with.

use super::{parse_data, validate_channel_name, Service};
use crate::protocol::{now_iso, ServerFrame};
use crate::registry::ClientId;
use crate::router::MessageRouter;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A client is marked offline after this long without a heartbeat.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    status: PresenceStatus,
    last_seen: i64,
    channels: HashSet<String>,
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct SetData {
    status: PresenceStatus,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    channel: String,
}

pub struct PresenceService {
    router: Arc<MessageRouter>,
    table: DashMap<ClientId, PresenceRecord>,
    timeout: Duration,
    sweep_interval: Duration,
}

impl PresenceService {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Self::with_timing(router, PRESENCE_TIMEOUT, SWEEP_INTERVAL)
    }

    /// Constructor with explicit timing, used by tests.
    pub fn with_timing(
        router: Arc<MessageRouter>,
        timeout: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            table: DashMap::new(),
            timeout,
            sweep_interval,
        })
    }

    fn presence_json(client_id: &ClientId, record: &PresenceRecord) -> Value {
        json!({
            "clientId": client_id,
            "status": record.status,
            "lastSeen": record.last_seen,
            "metadata": record.metadata,
        })
    }

    async fn publish_update(&self, client_id: &ClientId, record: &PresenceRecord) {
        let presence = Self::presence_json(client_id, record);
        for channel in &record.channels {
            let frame = json!({
                "type": "presence",
                "action": "update",
                "channel": channel,
                "presence": presence,
                "timestamp": now_iso(),
            });
            self.router
                .send_to_channel(&format!("presence:{}", channel), frame, None)
                .await;
        }
    }

    async fn set(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: SetData = match parse_data("presence", "set", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        for channel in &data.channels {
            if let Some(reason) = validate_channel_name(channel) {
                return ServerFrame::err("presence", "set", reason);
            }
        }

        let record = {
            let mut entry = self.table.entry(client_id).or_insert_with(|| PresenceRecord {
                status: data.status,
                last_seen: Utc::now().timestamp_millis(),
                channels: HashSet::new(),
                metadata: Value::Null,
            });
            entry.status = data.status;
            entry.last_seen = Utc::now().timestamp_millis();
            entry.channels.extend(data.channels.iter().cloned());
            if !data.metadata.is_null() {
                entry.metadata = data.metadata.clone();
            }
            entry.clone()
        };

        // Channel association here does not subscribe the client to the
        // presence channel; only the explicit subscribe action does.
        self.publish_update(&client_id, &record).await;

        ServerFrame::ok(
            "presence",
            "set",
            Self::presence_json(&client_id, &record),
        )
    }

    fn channel_presence(&self, channel: &str) -> Vec<Value> {
        self.table
            .iter()
            .filter(|entry| entry.value().channels.contains(channel))
            .map(|entry| Self::presence_json(entry.key(), entry.value()))
            .collect()
    }

    fn get(&self, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("presence", "get", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        ServerFrame::ok(
            "presence",
            "get",
            json!({"channel": data.channel, "presence": self.channel_presence(&data.channel)}),
        )
    }

    async fn subscribe(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("presence", "subscribe", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return ServerFrame::err("presence", "subscribe", reason);
        }
        if let Err(e) = self
            .router
            .subscribe_to_channel(&client_id, &format!("presence:{}", data.channel))
            .await
        {
            return ServerFrame::err("presence", "subscribe", e.to_string());
        }
        ServerFrame::ok(
            "presence",
            "subscribe",
            json!({"channel": data.channel, "presence": self.channel_presence(&data.channel)}),
        )
    }

    async fn unsubscribe(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("presence", "unsubscribe", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        self.router
            .unsubscribe_from_channel(&client_id, &format!("presence:{}", data.channel))
            .await;
        ServerFrame::ok("presence", "unsubscribe", json!({"channel": data.channel}))
    }

    async fn heartbeat(&self, client_id: ClientId) -> ServerFrame {
        let revived = {
            let mut entry = self.table.entry(client_id).or_insert_with(|| PresenceRecord {
                status: PresenceStatus::Online,
                last_seen: Utc::now().timestamp_millis(),
                channels: HashSet::new(),
                metadata: Value::Null,
            });
            entry.last_seen = Utc::now().timestamp_millis();
            if entry.status == PresenceStatus::Offline {
                entry.status = PresenceStatus::Online;
                Some(entry.clone())
            } else {
                None
            }
        };
        if let Some(record) = revived {
            self.publish_update(&client_id, &record).await;
        }
        ServerFrame::ok("presence", "heartbeat", json!({"acknowledged": true}))
    }

    /// One sweep pass: collect timed-out clients, flip them offline, then
    /// publish the transitions. Exposed for tests.
    pub async fn sweep(&self) {
        let cutoff = Utc::now().timestamp_millis() - self.timeout.as_millis() as i64;
        let mut transitions = Vec::new();
        for mut entry in self.table.iter_mut() {
            let key = *entry.key();
            let record = entry.value_mut();
            if record.status != PresenceStatus::Offline && record.last_seen < cutoff {
                record.status = PresenceStatus::Offline;
                transitions.push((key, record.clone()));
            }
        }
        for (client_id, record) in transitions {
            debug!("Presence timeout for {}", client_id);
            self.publish_update(&client_id, &record).await;
        }
    }

    /// Start the background sweeper. Failures are logged and the sweeper
    /// continues.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[async_trait]
impl Service for PresenceService {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn handle_action(
        &self,
        client_id: ClientId,
        action: &str,
        data: Value,
    ) -> Option<ServerFrame> {
        let frame = match action {
            "set" => self.set(client_id, data).await,
            "get" => self.get(data),
            "subscribe" => self.subscribe(client_id, data).await,
            "unsubscribe" => self.unsubscribe(client_id, data).await,
            "heartbeat" => self.heartbeat(client_id).await,
            other => ServerFrame::err("presence", other, format!("unknown action '{}'", other)),
        };
        Some(frame)
    }

    async fn on_client_disconnect(&self, client_id: ClientId) {
        if let Some((_, mut record)) = self.table.remove(&client_id) {
            if record.status != PresenceStatus::Offline {
                record.status = PresenceStatus::Offline;
                record.last_seen = Utc::now().timestamp_millis();
                self.publish_update(&client_id, &record).await;
            }
        }
    }

    fn stats(&self) -> Value {
        json!({"clients": self.table.len()})
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
        presence: Arc<PresenceService>,
        router: Arc<MessageRouter>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let node = Arc::new(NodeManager::new(8080, None, registry.clone()));
        let router = MessageRouter::new(node, registry, None, None);
        let presence = PresenceService::with_timing(router.clone(), timeout, Duration::from_millis(10));
        Fixture { presence, router }
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

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let fx = fixture(PRESENCE_TIMEOUT);
        let (alpha, _rx) = connect(&fx).await;

        let set = fx
            .presence
            .handle_action(alpha, "set", json!({"status": "busy", "channels": ["g"]}))
            .await
            .unwrap();
        assert_eq!(set.success, Some(true));
        assert_eq!(set.data.as_ref().unwrap()["status"], "busy");

        let get = fx
            .presence
            .handle_action(alpha, "get", json!({"channel": "g"}))
            .await
            .unwrap();
        let list = get.data.unwrap()["presence"].as_array().unwrap().clone();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["clientId"], alpha.to_string());
    }

    #[tokio::test]
    async fn invalid_status_is_an_input_error() {
        let fx = fixture(PRESENCE_TIMEOUT);
        let (alpha, _rx) = connect(&fx).await;
        let frame = fx
            .presence
            .handle_action(alpha, "set", json!({"status": "sleeping"}))
            .await
            .unwrap();
        assert_eq!(frame.success, Some(false));
    }

    #[tokio::test]
    async fn update_is_published_to_presence_subscribers() {
        let fx = fixture(PRESENCE_TIMEOUT);
        let (alpha, _rx_a) = connect(&fx).await;
        let (beta, mut rx_b) = connect(&fx).await;

        fx.presence
            .handle_action(beta, "subscribe", json!({"channel": "g"}))
            .await;

        fx.presence
            .handle_action(alpha, "set", json!({"status": "online", "channels": ["g"]}))
            .await;

        let update = recv_json(&mut rx_b);
        assert_eq!(update["type"], "presence");
        assert_eq!(update["action"], "update");
        assert_eq!(update["presence"]["status"], "online");
    }

    #[tokio::test]
    async fn sweeper_marks_offline_exactly_once() {
        let fx = fixture(Duration::from_millis(20));
        let (alpha, _rx_a) = connect(&fx).await;
        let (beta, mut rx_b) = connect(&fx).await;

        fx.presence
            .handle_action(beta, "subscribe", json!({"channel": "g"}))
            .await;
        fx.presence
            .handle_action(alpha, "set", json!({"status": "online", "channels": ["g"]}))
            .await;
        let first = recv_json(&mut rx_b);
        assert_eq!(first["presence"]["status"], "online");

        tokio::time::sleep(Duration::from_millis(40)).await;
        fx.presence.sweep().await;
        fx.presence.sweep().await;

        let offline = recv_json(&mut rx_b);
        assert_eq!(offline["presence"]["status"], "offline");
        // The second sweep must not re-publish the transition.
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_keeps_client_online_and_revives_offline() {
        let fx = fixture(Duration::from_millis(20));
        let (alpha, _rx_a) = connect(&fx).await;

        fx.presence
            .handle_action(alpha, "set", json!({"status": "online"}))
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        fx.presence.sweep().await;

        fx.presence.handle_action(alpha, "heartbeat", json!({})).await;
        let get = fx
            .presence
            .handle_action(alpha, "set", json!({"status": "online"}))
            .await
            .unwrap();
        assert_eq!(get.data.unwrap()["status"], "online");

        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.presence.sweep().await;
        // Fresh heartbeat: still online.
        let frame = fx
            .presence
            .handle_action(alpha, "get", json!({"channel": "none"}))
            .await
            .unwrap();
        assert_eq!(frame.success, Some(true));
    }
}
