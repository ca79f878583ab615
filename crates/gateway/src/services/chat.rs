//! Chat service: channel membership, message fan-out, and a bounded
//! in-memory history tail per channel.
//!
//! History is node-local by design: a client reconnecting to a different
//! node sees that node's tail, not a replicated log.

use super::{parse_data, validate_channel_name, Service};
use crate::protocol::{now_iso, ServerFrame};
use crate::registry::{ClientId, ConnectionRegistry};
use crate::router::MessageRouter;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Maximum retained messages per channel.
const HISTORY_LIMIT: usize = 100;

/// Messages replayed to a newly joined client.
const REPLAY_LIMIT: usize = 20;

/// Maximum chat message length, in characters.
const MAX_MESSAGE_LEN: usize = 1000;

/// A single chat message as stored and broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub client_id: ClientId,
    pub channel: String,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct JoinData {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct SendData {
    channel: String,
    message: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct HistoryData {
    channel: String,
    limit: Option<usize>,
}

pub struct ChatService {
    router: Arc<MessageRouter>,
    registry: Arc<ConnectionRegistry>,
    history: DashMap<String, Mutex<VecDeque<ChatMessage>>>,
}

impl ChatService {
    pub fn new(router: Arc<MessageRouter>, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            router,
            registry,
            history: DashMap::new(),
        })
    }

    fn recent(&self, channel: &str, limit: usize) -> Vec<ChatMessage> {
        match self.history.get(channel) {
            Some(ring) => {
                let ring = ring.lock().unwrap();
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn append(&self, message: ChatMessage) {
        let ring = self
            .history
            .entry(message.channel.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut ring = ring.lock().unwrap();
        ring.push_back(message);
        while ring.len() > HISTORY_LIMIT {
            ring.pop_front();
        }
    }

    fn is_joined(&self, client_id: &ClientId, channel: &str) -> bool {
        self.registry
            .get(client_id)
            .map(|conn| conn.channels.contains(channel))
            .unwrap_or(false)
    }

    async fn join(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: JoinData = match parse_data("chat", "join", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return ServerFrame::err("chat", "join", reason);
        }
        if let Err(e) = self.router.subscribe_to_channel(&client_id, &data.channel).await {
            return ServerFrame::err("chat", "join", e.to_string());
        }
        let recent = self.recent(&data.channel, REPLAY_LIMIT);
        ServerFrame::ok(
            "chat",
            "join",
            json!({"channel": data.channel, "recent": recent}),
        )
    }

    async fn leave(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: JoinData = match parse_data("chat", "leave", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        self.router
            .unsubscribe_from_channel(&client_id, &data.channel)
            .await;
        ServerFrame::ok("chat", "leave", json!({"channel": data.channel}))
    }

    async fn send(&self, client_id: ClientId, data: Value) -> ServerFrame {
        let data: SendData = match parse_data("chat", "send", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        if let Some(reason) = validate_channel_name(&data.channel) {
            return ServerFrame::err("chat", "send", reason);
        }
        if !self.is_joined(&client_id, &data.channel) {
            return ServerFrame::err(
                "chat",
                "send",
                format!("not joined to channel '{}'", data.channel),
            );
        }
        let len = data.message.chars().count();
        if len == 0 || len > MAX_MESSAGE_LEN {
            return ServerFrame::err(
                "chat",
                "send",
                format!("message length must be 1..={} characters", MAX_MESSAGE_LEN),
            );
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            client_id,
            channel: data.channel.clone(),
            message: data.message,
            metadata: data.metadata,
            timestamp: now_iso(),
        };
        self.append(message.clone());
        let message_value = serde_json::to_value(&message).unwrap_or(Value::Null);

        let broadcast = json!({
            "type": "chat",
            "action": "message",
            "channel": data.channel,
            "message": message_value,
            "timestamp": now_iso(),
        });
        self.router.send_to_channel(&message.channel, broadcast, None).await;

        ServerFrame::ok("chat", "sent", serde_json::to_value(&message).unwrap_or(Value::Null))
    }

    fn history(&self, data: Value) -> ServerFrame {
        let data: HistoryData = match parse_data("chat", "history", data) {
            Ok(d) => d,
            Err(frame) => return *frame,
        };
        let limit = data.limit.unwrap_or(50).min(HISTORY_LIMIT);
        let messages = self.recent(&data.channel, limit);
        ServerFrame::ok(
            "chat",
            "history",
            json!({"channel": data.channel, "messages": messages}),
        )
    }
}

#[async_trait]
impl Service for ChatService {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn handle_action(
        &self,
        client_id: ClientId,
        action: &str,
        data: Value,
    ) -> Option<ServerFrame> {
        let frame = match action {
            "join" => self.join(client_id, data).await,
            "leave" => self.leave(client_id, data).await,
            "send" => self.send(client_id, data).await,
            "history" => self.history(data),
            other => ServerFrame::err("chat", other, format!("unknown action '{}'", other)),
        };
        Some(frame)
    }

    fn stats(&self) -> Value {
        let total: usize = self
            .history
            .iter()
            .map(|ring| ring.value().lock().unwrap().len())
            .sum();
        json!({"channels": self.history.len(), "messages": total})
    }
}
