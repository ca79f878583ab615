//! Reaction service: ephemeral emoji reactions validated against a fixed
//! catalog, with a small per-channel ring of recent reactions.

use super::{parse_data, validate_channel_name, Service};
use crate::protocol::{now_iso, ServerFrame};
use crate::registry::ClientId;
use crate::router::MessageRouter;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Maximum retained reactions per channel.
const RING_LIMIT: usize = 50;

/// The emoji catalog: emoji → visual effect name.
const CATALOG: [(&str, &str); 8] = [
    ("❤️", "hearts"),
    ("👍", "thumbs_up"),
    ("👎", "thumbs_down"),
    ("🎉", "confetti"),
    ("😂", "laugh"),
    ("🔥", "fire"),
    ("👏", "applause"),
    ("😮", "wow"),
];

fn effect_for(emoji: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|(e, _)| *e == emoji)
        .map(|(_, effect)| *effect)
}

/// One recorded reaction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: Uuid,
    pub client_id: ClientId,
    pub channel: String,
    pub emoji: String,
    pub effect: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub position: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct SendData {
    channel: String,
    emoji: String,
    #[serde(default)]
    position: Value,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    channel: String,
}

pub struct ReactionService {
    router: Arc<MessageRouter>,
    rings: DashMap<String, Mutex<VecDeque<Reaction>>>,
}

impl ReactionService {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self {
            router,
            rings: DashMap::new(),
        })
    }

    fn recent(&self, channel: &str) -> Vec<Reaction> {
        match self.rings.get(channel) {
            Some(ring) => ring.lock().unwrap().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn record(&self, reaction: Reaction) {
        let ring = self
            .rings
            .entry(reaction.channel.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut ring = ring.lock().unwrap();
        ring.push_back(reaction);
        while ring.len() > RING_LIMIT {
            ring.pop_front();
        }
    }

    async fn send(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: SendData = match parse_data("reaction", "send", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return ServerFrame::err("reaction", "send", reason);
        }
        let Some(effect) = effect_for(&data.emoji) else {
            return ServerFrame::err("reaction", "send", format!("unknown emoji '{}'", data.emoji));
        };

        let reaction = Reaction {
            id: Uuid::new_v4(),
            client_id,
            channel: data.channel.clone(),
            emoji: data.emoji,
            effect,
            position: data.position,
            metadata: data.metadata,
            timestamp: now_iso(),
        };
        self.record(reaction.clone());
        let reaction_value = serde_json::to_value(&reaction).unwrap_or(Value::Null);

        let broadcast = json!({
            "type": "reaction",
            "action": "reaction",
            "channel": data.channel,
            "reaction": reaction_value.clone(),
            "timestamp": now_iso(),
        });
        self.router
            .send_to_channel(&format!("reactions:{}", reaction.channel), broadcast, None)
            .await;

        ServerFrame::ok("reaction", "reaction_sent", reaction_value)
    }

    async fn subscribe(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("reaction", "subscribe", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return ServerFrame::err("reaction", "subscribe", reason);
        }
        if let Err(e) = self
            .router
            .subscribe_to_channel(&client_id, &format!("reactions:{}", data.channel))
            .await
        {
            return ServerFrame::err("reaction", "subscribe", e.to_string());
        }
        ServerFrame::ok(
            "reaction",
            "subscribe",
            json!({"channel": data.channel, "recent": self.recent(&data.channel)}),
        )
    }

    async fn unsubscribe(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: ChannelData = match parse_data("reaction", "unsubscribe", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        self.router
            .unsubscribe_from_channel(&client_id, &format!("reactions:{}", data.channel))
            .await;
        ServerFrame::ok("reaction", "unsubscribe", json!({"channel": data.channel}))
    }

    fn get_available(&self) -> ServerFrame {
        let catalog: Vec<Value> = CATALOG
            .iter()
            .map(|(emoji, effect)| json!({"emoji": emoji, "effect": effect}))
            .collect();
        ServerFrame::ok("reaction", "getAvailable", json!({"reactions": catalog}))
    }
}

#[async_trait]
impl Service for ReactionService {
    fn name(&self) -> &'static str {
        "reaction"
    }

    async fn handle_action(
        &self,
        client_id: ClientId,
        action: &str,
        data: Value,
    ) -> Option<ServerFrame> {
        let frame = match action {
            "send" => self.send(client_id, data).await,
            "subscribe" => self.subscribe(client_id, data).await,
            "unsubscribe" => self.unsubscribe(client_id, data).await,
            "getAvailable" => self.get_available(),
            other => ServerFrame::err("reaction", other, format!("unknown action '{}'", other)),
        };
        Some(frame)
    }

    fn stats(&self) -> Value {
        let total: usize = self
            .rings
            .iter()
            .map(|ring| ring.value().lock().unwrap().len())
            .sum();
        json!({"channels": self.rings.len(), "reactions": total})
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
        reaction: Arc<ReactionService>,
        router: Arc<MessageRouter>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let node = Arc::new(NodeManager::new(8080, None, registry.clone()));
        let router = MessageRouter::new(node, registry, None, None);
        let reaction = ReactionService::new(router.clone());
        Fixture { reaction, router }
    }

    async fn connect(fx: &Fixture) -> (ClientId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(128);
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
    async fn send_broadcasts_and_acks() {
        let fx = fixture();
        let (alpha, mut rx_a) = connect(&fx).await;
        let (beta, mut rx_b) = connect(&fx).await;
        fx.reaction
            .handle_action(beta, "subscribe", json!({"channel": "g"}))
            .await;

        let ack = fx
            .reaction
            .handle_action(alpha, "send", json!({"channel": "g", "emoji": "🎉"}))
            .await
            .unwrap();
        assert_eq!(ack.action.as_deref(), Some("reaction_sent"));
        assert_eq!(ack.data.as_ref().unwrap()["effect"], "confetti");

        let frame = recv_json(&mut rx_b);
        assert_eq!(frame["type"], "reaction");
        assert_eq!(frame["reaction"]["emoji"], "🎉");
        // The sender is not subscribed, so only the ack reaches it.
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_emoji_is_rejected() {
        let fx = fixture();
        let (alpha, _rx) = connect(&fx).await;
        let frame = fx
            .reaction
            .handle_action(alpha, "send", json!({"channel": "g", "emoji": "🦖"}))
            .await
            .unwrap();
        assert_eq!(frame.success, Some(false));
        assert!(frame.error.unwrap().contains("unknown emoji"));
    }

    #[tokio::test]
    async fn ring_is_capped() {
        let fx = fixture();
        let (alpha, _rx) = connect(&fx).await;
        for _ in 0..60 {
            fx.reaction
                .handle_action(alpha, "send", json!({"channel": "g", "emoji": "🔥"}))
                .await;
        }
        let (beta, _rx_b) = connect(&fx).await;
        let frame = fx
            .reaction
            .handle_action(beta, "subscribe", json!({"channel": "g"}))
            .await
            .unwrap();
        let recent = frame.data.unwrap()["recent"].as_array().unwrap().len();
        assert_eq!(recent, 50);
    }

    #[tokio::test]
    async fn catalog_is_exposed() {
        let fx = fixture();
        let (alpha, _rx) = connect(&fx).await;
        let frame = fx
            .reaction
            .handle_action(alpha, "getAvailable", json!({}))
            .await
            .unwrap();
        let reactions = frame.data.unwrap()["reactions"].as_array().unwrap().clone();
        assert_eq!(reactions.len(), CATALOG.len());
        assert!(reactions.iter().any(|r| r["effect"] == "confetti"));
    }
}
