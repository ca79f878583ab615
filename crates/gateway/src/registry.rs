//! Connection registry: per-process client state and egress access.
//!
//! The registry is the only component that touches the wire egress. Each
//! client's writes go through a bounded queue pumped by its writer task;
//! a full queue means the peer is too slow and the client is disconnected
//! rather than blocking inbound dispatch.

use crate::protocol::ServerFrame;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Capacity of the per-client egress queue.
pub const EGRESS_QUEUE_CAP: usize = 256;

/// Close code sent on graceful node shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code sent when a slow client overflows its egress queue.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// State for a single connected client.
pub struct ClientConnection {
    /// Unique client identifier.
    pub id: ClientId,
    /// Connect metadata supplied at accept time.
    pub metadata: Value,
    /// Channels this client is subscribed to (maintained by the router).
    pub channels: DashSet<String>,
    /// Epoch millis at accept.
    pub joined_at: i64,
    tx: mpsc::Sender<Message>,
    close: watch::Sender<Option<u16>>,
}

impl ClientConnection {
    /// Create a connection around an egress sender. Returns the connection
    /// and the receiver its writer/ingress tasks watch for forced closes.
    pub fn new(tx: mpsc::Sender<Message>, metadata: Value) -> (Arc<Self>, watch::Receiver<Option<u16>>) {
        let (close, close_rx) = watch::channel(None);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            metadata,
            channels: DashSet::new(),
            joined_at: Utc::now().timestamp_millis(),
            tx,
            close,
        });
        (conn, close_rx)
    }

    /// Queue a raw text frame. Returns false when the egress is gone; a
    /// full queue additionally requests a 1013 close for this client.
    pub fn send_text(&self, text: String) -> bool {
        match self.tx.try_send(Message::Text(text.into())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("gateway_egress_overflow_total").increment(1);
                warn!("Egress queue full for {}, disconnecting", self.id);
                self.request_close(CLOSE_TRY_AGAIN_LATER);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a response frame.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        self.send_text(frame.to_json())
    }

    /// Queue a ws protocol message (ping/pong/close passthrough).
    pub fn send_message(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Ask the connection tasks to close the socket with `code`.
    pub fn request_close(&self, code: u16) {
        let _ = self.close.send(Some(code));
    }
}

/// Per-process mapping from client id to connection state.
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, conn: Arc<ClientConnection>) -> ClientId {
        let id = conn.id;
        self.clients.insert(id, conn);
        gauge!("gateway_active_connections").set(self.clients.len() as f64);
        info!("Client {} registered", id);
        id
    }

    /// Remove a client. Returns the removed state, if any.
    pub fn unregister(&self, client_id: &ClientId) -> Option<Arc<ClientConnection>> {
        let removed = self.clients.remove(client_id).map(|(_, conn)| conn);
        if removed.is_some() {
            gauge!("gateway_active_connections").set(self.clients.len() as f64);
            info!("Client {} unregistered", client_id);
        }
        removed
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Serialize `payload` (unless it is already a string) and write it to
    /// the client's egress. Returns false if the egress is closed.
    pub fn send_to_local_client(&self, client_id: &ClientId, payload: &Value) -> bool {
        let Some(conn) = self.get(client_id) else {
            debug!("send_to_local_client: {} not registered", client_id);
            return false;
        };
        let text = match payload {
            Value::String(s) => s.clone(),
            other => match serde_json::to_string(other) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Unserializable payload for {}: {}", client_id, e);
                    return false;
                }
            },
        };
        conn.send_text(text)
    }

    /// All local clients subscribed to `channel`.
    pub fn local_subscribers(&self, channel: &str) -> Vec<Arc<ClientConnection>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().channels.contains(channel))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Whether any local client other than `except` subscribes to `channel`.
    pub fn has_other_subscriber(&self, channel: &str, except: &ClientId) -> bool {
        self.clients
            .iter()
            .any(|entry| entry.key() != except && entry.value().channels.contains(channel))
    }

    /// All registered connections.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of distinct channels with at least one local subscriber.
    pub fn channel_count(&self) -> usize {
        let mut channels = HashSet::new();
        for entry in self.clients.iter() {
            for ch in entry.value().channels.iter() {
                channels.insert(ch.clone());
            }
        }
        channels.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_conn(cap: usize) -> (Arc<ClientConnection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(cap);
        let (conn, _close_rx) = ClientConnection::new(tx, json!({}));
        (conn, rx)
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_conn(8);
        let id = registry.register(conn);
        assert!(registry.contains(&id));
        assert_eq!(registry.client_count(), 1);
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn string_payload_is_passed_through() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = test_conn(8);
        let id = registry.register(conn);

        assert!(registry.send_to_local_client(&id, &Value::String("raw".into())));
        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "raw"),
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(registry.send_to_local_client(&id, &json!({"a": 1})));
        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"a":1}"#),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn overflow_requests_try_again_later_close() {
        let (tx, _rx) = mpsc::channel(1);
        let (conn, close_rx) = ClientConnection::new(tx, json!({}));

        assert!(conn.send_text("first".into()));
        assert!(!conn.send_text("second".into()));
        assert_eq!(*close_rx.borrow(), Some(CLOSE_TRY_AGAIN_LATER));
    }

    #[test]
    fn local_subscribers_filter_by_channel() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = test_conn(8);
        let (b, _rb) = test_conn(8);
        let a_id = registry.register(a.clone());
        let b_id = registry.register(b.clone());

        a.channels.insert("general".to_string());
        b.channels.insert("general".to_string());
        b.channels.insert("random".to_string());

        assert_eq!(registry.local_subscribers("general").len(), 2);
        assert_eq!(registry.local_subscribers("random").len(), 1);
        assert!(registry.has_other_subscriber("general", &a_id));
        assert!(!registry.has_other_subscriber("random", &b_id));
        assert_eq!(registry.channel_count(), 2);
    }
}
