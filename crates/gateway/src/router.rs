//! Message router: logical sends → targeted cross-node deliveries.
//!
//! A logical send is translated into the minimum set of wire operations:
//! channel traffic rides `websocket:route:<channel>` (subscribed only by
//! nodes hosting a subscriber), direct messages ride
//! `websocket:direct:<nodeId>` (subscribed by exactly one node), and global
//! broadcasts ride `websocket:broadcast:all`. Inbound envelopes are
//! filtered by `targetNodes` membership (a stale route subscription drops
//! a message on arrival rather than misdelivering it) and broadcasts are
//! deduplicated by `fromNode`.
//!
//! Delivery is best effort: when no node serves a channel at publish time
//! the message is dropped, and there is no retry or replay.

use crate::error::{GatewayError, Result};
use crate::keys;
use crate::node::NodeManager;
use crate::registry::{ClientId, ConnectionRegistry};
use chrono::Utc;
use kvps_client::{KvpsClient, KvpsSubscriber, MessageHandler};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Cross-node message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    DirectMessage,
    Broadcast,
    ChannelMessage,
}

/// Envelope published on the KVPS pub/sub fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEnvelope {
    #[serde(rename = "type")]
    pub kind: RouteKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub message: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_client_id: Option<ClientId>,
    pub from_node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_nodes: Option<Vec<String>>,
    pub timestamp: i64,
}

impl RouteEnvelope {
    fn channel_message(
        channel: &str,
        message: Value,
        exclude_client_id: Option<ClientId>,
        from_node: &str,
        target_nodes: Vec<String>,
    ) -> Self {
        Self {
            kind: RouteKind::ChannelMessage,
            channel: Some(channel.to_string()),
            client_id: None,
            message,
            exclude_client_id,
            from_node: from_node.to_string(),
            target_nodes: Some(target_nodes),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn direct(client_id: ClientId, message: Value, from_node: &str) -> Self {
        Self {
            kind: RouteKind::DirectMessage,
            channel: None,
            client_id: Some(client_id),
            message,
            exclude_client_id: None,
            from_node: from_node.to_string(),
            target_nodes: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn broadcast(message: Value, exclude_client_id: Option<ClientId>, from_node: &str) -> Self {
        Self {
            kind: RouteKind::Broadcast,
            channel: None,
            client_id: None,
            message,
            exclude_client_id,
            from_node: from_node.to_string(),
            target_nodes: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// The routing core. One per process.
pub struct MessageRouter {
    node: Arc<NodeManager>,
    registry: Arc<ConnectionRegistry>,
    kvps: Option<KvpsClient>,
    subscriber: Option<Arc<KvpsSubscriber>>,
    /// Logical channels whose route topic this process is subscribed to.
    route_subs: Mutex<HashSet<String>>,
    weak_self: Weak<MessageRouter>,
}

impl MessageRouter {
    pub fn new(
        node: Arc<NodeManager>,
        registry: Arc<ConnectionRegistry>,
        kvps: Option<KvpsClient>,
        subscriber: Option<Arc<KvpsSubscriber>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            node,
            registry,
            kvps,
            subscriber,
            route_subs: Mutex::new(HashSet::new()),
            weak_self: weak.clone(),
        })
    }

    /// Subscribe this node's direct and broadcast topics. Call once after
    /// node registration.
    pub async fn start(&self) -> Result<()> {
        let Some(sub) = &self.subscriber else {
            return Ok(());
        };
        let handler = self.envelope_handler();
        sub.subscribe(&keys::direct_channel(self.node.node_id()), handler.clone())
            .await?;
        sub.subscribe(keys::BROADCAST_CHANNEL, handler).await?;
        Ok(())
    }

    fn envelope_handler(&self) -> MessageHandler {
        let weak = self.weak_self.clone();
        Arc::new(move |_channel, payload| {
            if let Some(router) = weak.upgrade() {
                router.handle_envelope(payload);
            }
        })
    }

    fn active_kvps(&self) -> Option<&KvpsClient> {
        if self.node.is_standalone() {
            None
        } else {
            self.kvps.as_ref()
        }
    }

    // =========================================================================
    // Local client lifecycle
    // =========================================================================

    /// Register a locally accepted connection with the registry and the
    /// shared directory.
    pub async fn register_local_client(&self, conn: Arc<crate::registry::ClientConnection>) {
        counter!("gateway_connections_total").increment(1);
        let metadata = conn.metadata.clone();
        let id = self.registry.register(conn);
        self.node.register_client(&id, &metadata).await;
    }

    /// Tear down a local client. Idempotent; safe to call after the
    /// underlying connection is already closed.
    pub async fn unregister_local_client(&self, client_id: &ClientId) {
        let Some(conn) = self.registry.get(client_id) else {
            return;
        };
        let channels: Vec<String> = conn.channels.iter().map(|c| c.clone()).collect();
        for channel in channels {
            self.unsubscribe_from_channel(client_id, &channel).await;
        }
        self.registry.unregister(client_id);
        self.node.unregister_client(client_id).await;
    }

    // =========================================================================
    // Channel membership
    // =========================================================================

    /// Subscribe a local client to a logical channel. Ensures the process
    /// holds exactly one KVPS subscription to the channel's route topic no
    /// matter how many local clients join. Re-issuing for an
    /// already-subscribed pair is a no-op.
    pub async fn subscribe_to_channel(&self, client_id: &ClientId, channel: &str) -> Result<()> {
        let conn = self
            .registry
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;
        if !conn.channels.insert(channel.to_string()) {
            return Ok(());
        }
        self.node.subscribe_client_to_channel(client_id, channel).await;
        self.ensure_route_subscription(channel).await;
        Ok(())
    }

    /// Inverse of [`Self::subscribe_to_channel`]; drops the process-level
    /// route subscription iff no local client still needs it.
    pub async fn unsubscribe_from_channel(&self, client_id: &ClientId, channel: &str) {
        let Some(conn) = self.registry.get(client_id) else {
            return;
        };
        if conn.channels.remove(channel).is_none() {
            return;
        }
        self.node
            .unsubscribe_client_from_channel(client_id, channel)
            .await;
        self.release_route_subscription(channel).await;
    }

    async fn ensure_route_subscription(&self, channel: &str) {
        let Some(sub) = &self.subscriber else { return };
        let mut subs = self.route_subs.lock().await;
        if subs.contains(channel) {
            return;
        }
        match sub
            .subscribe(&keys::route_channel(channel), self.envelope_handler())
            .await
        {
            Ok(()) => {
                subs.insert(channel.to_string());
            }
            Err(e) => warn!("Route subscribe failed for '{}': {}", channel, e),
        }
    }

    async fn release_route_subscription(&self, channel: &str) {
        let Some(sub) = &self.subscriber else { return };
        if !self.registry.local_subscribers(channel).is_empty() {
            return;
        }
        let mut subs = self.route_subs.lock().await;
        if subs.remove(channel) {
            if let Err(e) = sub.unsubscribe(&keys::route_channel(channel)).await {
                warn!("Route unsubscribe failed for '{}': {}", channel, e);
            }
        }
    }

    // =========================================================================
    // Sends
    // =========================================================================

    /// Fan `payload` out to every subscriber of `channel`, cluster-wide.
    pub async fn send_to_channel(
        &self,
        channel: &str,
        payload: Value,
        exclude_client_id: Option<ClientId>,
    ) {
        counter!("gateway_channel_sends_total").increment(1);

        let Some(kvps) = self.active_kvps() else {
            self.deliver_to_channel_local(channel, &payload, exclude_client_id);
            return;
        };

        let nodes = self.node.get_nodes_for_channel(channel).await;
        if nodes.is_empty() {
            counter!("gateway_messages_dropped_total", "reason" => "no_subscribers").increment(1);
            debug!("No nodes serve '{}', dropping message", channel);
            return;
        }

        let envelope = RouteEnvelope::channel_message(
            channel,
            payload,
            exclude_client_id,
            self.node.node_id(),
            nodes,
        );
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!("Unserializable channel envelope: {}", e);
                return;
            }
        };
        if let Err(e) = kvps.publish(&keys::route_channel(channel), &json).await {
            // The fabric is down; local subscribers still get the message.
            warn!("Publish on route '{}' failed ({}), local fan-out only", channel, e);
            self.deliver_to_channel_local(channel, &envelope.message, exclude_client_id);
        }
    }

    /// Deliver `payload` to a single client wherever it is connected.
    /// Unknown clients are dropped with a warning; there is no retry.
    pub async fn send_to_client(&self, client_id: &ClientId, payload: Value) {
        if self.registry.contains(client_id) {
            if !self.registry.send_to_local_client(client_id, &payload) {
                self.spawn_unregister(*client_id);
            }
            return;
        }

        let Some(kvps) = self.active_kvps() else {
            warn!("Client {} unknown in standalone mode, dropping", client_id);
            return;
        };

        match self.node.get_client_node(client_id).await {
            Some(node) if node == self.node.node_id() => {
                // Stale directory entry; the local connection is gone.
                warn!("Directory maps {} to this node but it is not connected", client_id);
            }
            Some(node) => {
                let envelope = RouteEnvelope::direct(*client_id, payload, self.node.node_id());
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if let Err(e) = kvps.publish(&keys::direct_channel(&node), &json).await {
                            warn!("Direct publish to node {} failed: {}", node, e);
                        }
                    }
                    Err(e) => warn!("Unserializable direct envelope: {}", e),
                }
            }
            None => {
                counter!("gateway_messages_dropped_total", "reason" => "unknown_client")
                    .increment(1);
                warn!("Client {} not in directory, dropping direct message", client_id);
            }
        }
    }

    /// Deliver `payload` to every connected client on every node.
    pub async fn broadcast_to_all(&self, payload: Value, exclude_client_id: Option<ClientId>) {
        // The originator delivers locally itself; receivers drop our
        // envelope by fromNode.
        self.deliver_to_all_local(&payload, exclude_client_id);

        let Some(kvps) = self.active_kvps() else { return };
        let envelope = RouteEnvelope::broadcast(payload, exclude_client_id, self.node.node_id());
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if let Err(e) = kvps.publish(keys::BROADCAST_CHANNEL, &json).await {
                    warn!("Broadcast publish failed: {}", e);
                }
            }
            Err(e) => warn!("Unserializable broadcast envelope: {}", e),
        }
    }

    // =========================================================================
    // Inbound dispatch and local fan-out
    // =========================================================================

    /// Handle one inbound envelope from the KVPS fabric. Runs on the
    /// subscriber dispatch task, so it never blocks and never publishes on
    /// the subscriber connection.
    pub fn handle_envelope(&self, payload: &str) {
        counter!("gateway_envelopes_received_total").increment(1);
        let envelope: RouteEnvelope = match serde_json::from_str(payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("Undecodable route envelope: {}", e);
                return;
            }
        };

        match envelope.kind {
            RouteKind::ChannelMessage => {
                let Some(channel) = envelope.channel.as_deref() else {
                    warn!("Channel envelope without a channel");
                    return;
                };
                if let Some(targets) = &envelope.target_nodes {
                    if !targets.iter().any(|n| n == self.node.node_id()) {
                        // Stale route subscription relative to the node set
                        // at publish time.
                        counter!("gateway_messages_dropped_total", "reason" => "not_targeted")
                            .increment(1);
                        debug!("Dropping '{}' message not targeted at this node", channel);
                        return;
                    }
                }
                self.deliver_to_channel_local(channel, &envelope.message, envelope.exclude_client_id);
            }
            RouteKind::Broadcast => {
                if envelope.from_node == self.node.node_id() {
                    return;
                }
                self.deliver_to_all_local(&envelope.message, envelope.exclude_client_id);
            }
            RouteKind::DirectMessage => {
                let Some(client_id) = envelope.client_id else {
                    warn!("Direct envelope without a clientId");
                    return;
                };
                let delivered = self.registry.send_to_local_client(&client_id, &envelope.message);
                if !delivered {
                    if self.registry.contains(&client_id) {
                        self.spawn_unregister(client_id);
                    } else {
                        debug!("Direct message for unknown client {}", client_id);
                    }
                }
            }
        }
    }

    /// Write `payload` to every local subscriber of `channel`. Failed
    /// egresses trigger unregistration of the client.
    pub fn deliver_to_channel_local(
        &self,
        channel: &str,
        payload: &Value,
        exclude_client_id: Option<ClientId>,
    ) {
        let text = match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut failed = Vec::new();
        for conn in self.registry.local_subscribers(channel) {
            if Some(conn.id) == exclude_client_id {
                continue;
            }
            if conn.send_text(text.clone()) {
                counter!("gateway_messages_delivered_total").increment(1);
            } else {
                failed.push(conn.id);
            }
        }
        for id in failed {
            self.spawn_unregister(id);
        }
    }

    fn deliver_to_all_local(&self, payload: &Value, exclude_client_id: Option<ClientId>) {
        let text = match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut failed = Vec::new();
        for conn in self.registry.all() {
            if Some(conn.id) == exclude_client_id {
                continue;
            }
            if conn.send_text(text.clone()) {
                counter!("gateway_messages_delivered_total").increment(1);
            } else {
                failed.push(conn.id);
            }
        }
        for id in failed {
            self.spawn_unregister(id);
        }
    }

    /// Full cleanup of a client whose egress failed, off the hot path.
    fn spawn_unregister(&self, client_id: ClientId) {
        counter!("gateway_peer_errors_total").increment(1);
        if let Some(router) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                router.unregister_local_client(&client_id).await;
            });
        }
    }

    /// Channels this process currently routes from the fabric.
    pub async fn route_subscription_count(&self) -> usize {
        self.route_subs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientConnection;
    use axum::extract::ws::Message;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn standalone_router() -> (Arc<MessageRouter>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let node = Arc::new(NodeManager::new(8080, None, registry.clone()));
        let router = MessageRouter::new(node, registry.clone(), None, None);
        (router, registry)
    }

    async fn connect_client(router: &Arc<MessageRouter>) -> (ClientId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(32);
        let (conn, _close) = ClientConnection::new(tx, json!({}));
        let id = conn.id;
        router.register_local_client(conn).await;
        (id, rx)
    }

    fn recv_json(rx: &mut mpsc::Receiver<Message>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn envelope_wire_shape() {
        let id = uuid::Uuid::new_v4();
        let envelope = RouteEnvelope::channel_message(
            "general",
            json!({"hello": true}),
            Some(id),
            "node-a",
            vec!["node-a".into(), "node-b".into()],
        );
        let v: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(v["type"], "channel_message");
        assert_eq!(v["channel"], "general");
        assert_eq!(v["excludeClientId"], id.to_string());
        assert_eq!(v["fromNode"], "node-a");
        assert_eq!(v["targetNodes"][1], "node-b");
        assert!(v["timestamp"].is_i64());
        assert!(v.get("clientId").is_none());
    }

    #[tokio::test]
    async fn channel_send_reaches_all_subscribers() {
        let (router, _registry) = standalone_router();
        let (a, mut rx_a) = connect_client(&router).await;
        let (b, mut rx_b) = connect_client(&router).await;
        let (_c, mut rx_c) = connect_client(&router).await;

        router.subscribe_to_channel(&a, "general").await.unwrap();
        router.subscribe_to_channel(&b, "general").await.unwrap();

        router
            .send_to_channel("general", json!({"n": 1}), None)
            .await;

        assert_eq!(recv_json(&mut rx_a)["n"], 1);
        assert_eq!(recv_json(&mut rx_b)["n"], 1);
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn exclude_client_is_skipped() {
        let (router, _registry) = standalone_router();
        let (a, mut rx_a) = connect_client(&router).await;
        let (b, mut rx_b) = connect_client(&router).await;
        router.subscribe_to_channel(&a, "general").await.unwrap();
        router.subscribe_to_channel(&b, "general").await.unwrap();

        router
            .send_to_channel("general", json!({"n": 2}), Some(a))
            .await;

        assert!(rx_a.try_recv().is_err());
        assert_eq!(recv_json(&mut rx_b)["n"], 2);
    }

    #[tokio::test]
    async fn resubscribe_is_a_noop_and_unsubscribe_restores() {
        let (router, registry) = standalone_router();
        let (a, _rx) = connect_client(&router).await;

        router.subscribe_to_channel(&a, "general").await.unwrap();
        router.subscribe_to_channel(&a, "general").await.unwrap();
        assert_eq!(registry.local_subscribers("general").len(), 1);

        router.unsubscribe_from_channel(&a, "general").await;
        assert!(registry.local_subscribers("general").is_empty());
        // A second unsubscribe must be harmless.
        router.unsubscribe_from_channel(&a, "general").await;
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (router, registry) = standalone_router();
        let (a, _rx) = connect_client(&router).await;
        router.subscribe_to_channel(&a, "general").await.unwrap();

        router.unregister_local_client(&a).await;
        assert!(!registry.contains(&a));
        router.unregister_local_client(&a).await;
    }

    #[tokio::test]
    async fn direct_send_delivers_locally() {
        let (router, _registry) = standalone_router();
        let (a, mut rx_a) = connect_client(&router).await;

        router.send_to_client(&a, json!({"direct": true})).await;
        assert_eq!(recv_json(&mut rx_a)["direct"], true);

        // Unknown target: dropped without panicking.
        let ghost = uuid::Uuid::new_v4();
        router.send_to_client(&ghost, json!({})).await;
    }

    #[tokio::test]
    async fn inbound_envelope_honors_target_nodes() {
        let (router, _registry) = standalone_router();
        let (a, mut rx_a) = connect_client(&router).await;
        router.subscribe_to_channel(&a, "q").await.unwrap();

        let not_for_us = RouteEnvelope::channel_message(
            "q",
            json!({"n": 1}),
            None,
            "node-x",
            vec!["node-y".into()],
        );
        router.handle_envelope(&serde_json::to_string(&not_for_us).unwrap());
        assert!(rx_a.try_recv().is_err());

        let for_us = RouteEnvelope::channel_message(
            "q",
            json!({"n": 2}),
            None,
            "node-x",
            vec![router.node.node_id().to_string()],
        );
        router.handle_envelope(&serde_json::to_string(&for_us).unwrap());
        assert_eq!(recv_json(&mut rx_a)["n"], 2);
    }

    #[tokio::test]
    async fn inbound_broadcast_dedups_by_from_node() {
        let (router, _registry) = standalone_router();
        let (_a, mut rx_a) = connect_client(&router).await;

        let own = RouteEnvelope::broadcast(json!({"n": 1}), None, router.node.node_id());
        router.handle_envelope(&serde_json::to_string(&own).unwrap());
        assert!(rx_a.try_recv().is_err());

        let remote = RouteEnvelope::broadcast(json!({"n": 2}), None, "node-z");
        router.handle_envelope(&serde_json::to_string(&remote).unwrap());
        assert_eq!(recv_json(&mut rx_a)["n"], 2);
    }

    #[tokio::test]
    async fn broadcast_to_all_delivers_locally_with_exclusion() {
        let (router, _registry) = standalone_router();
        let (a, mut rx_a) = connect_client(&router).await;
        let (_b, mut rx_b) = connect_client(&router).await;

        router.broadcast_to_all(json!({"hello": 1}), Some(a)).await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(recv_json(&mut rx_b)["hello"], 1);
    }
}
