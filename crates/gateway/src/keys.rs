//! KVPS key and pub/sub channel layout.
//!
//! Everything the gateway persists lives under the `websocket:` prefix:
//!
//! ```text
//! websocket:nodes                      → set<nodeId>
//! websocket:node:<nodeId>:info         → hash
//! websocket:node:<nodeId>:heartbeat    → hash (TTL 3×heartbeat interval)
//! websocket:node:<nodeId>:clients      → set<clientId>
//! websocket:node:<nodeId>:channels     → set<channel>
//! websocket:client:<clientId>:node     → string(nodeId)
//! websocket:client:<clientId>:channels → set<channel>
//! websocket:client:<clientId>:metadata → hash
//! websocket:channel:<channel>:nodes    → set<nodeId>
//! websocket:route:<channel>            → pub/sub
//! websocket:direct:<nodeId>            → pub/sub
//! websocket:broadcast:all              → pub/sub
//! ```
//!
//! Hash values are strings; complex values are JSON-encoded.

/// Set of currently registered node ids.
pub const NODES_SET: &str = "websocket:nodes";

/// Global broadcast pub/sub channel, subscribed by every node.
pub const BROADCAST_CHANNEL: &str = "websocket:broadcast:all";

pub fn node_info(node_id: &str) -> String {
    format!("websocket:node:{}:info", node_id)
}

pub fn node_heartbeat(node_id: &str) -> String {
    format!("websocket:node:{}:heartbeat", node_id)
}

pub fn node_clients(node_id: &str) -> String {
    format!("websocket:node:{}:clients", node_id)
}

pub fn node_channels(node_id: &str) -> String {
    format!("websocket:node:{}:channels", node_id)
}

pub fn client_node(client_id: &str) -> String {
    format!("websocket:client:{}:node", client_id)
}

pub fn client_channels(client_id: &str) -> String {
    format!("websocket:client:{}:channels", client_id)
}

pub fn client_metadata(client_id: &str) -> String {
    format!("websocket:client:{}:metadata", client_id)
}

pub fn channel_nodes(channel: &str) -> String {
    format!("websocket:channel:{}:nodes", channel)
}

/// Pub/sub topic carrying one logical channel's cross-node traffic.
pub fn route_channel(channel: &str) -> String {
    format!("websocket:route:{}", channel)
}

/// Pub/sub topic for direct-to-client routing, subscribed by one node.
pub fn direct_channel(node_id: &str) -> String {
    format!("websocket:direct:{}", node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(node_info("n1"), "websocket:node:n1:info");
        assert_eq!(node_heartbeat("n1"), "websocket:node:n1:heartbeat");
        assert_eq!(node_clients("n1"), "websocket:node:n1:clients");
        assert_eq!(node_channels("n1"), "websocket:node:n1:channels");
        assert_eq!(client_node("c1"), "websocket:client:c1:node");
        assert_eq!(client_channels("c1"), "websocket:client:c1:channels");
        assert_eq!(client_metadata("c1"), "websocket:client:c1:metadata");
        assert_eq!(channel_nodes("general"), "websocket:channel:general:nodes");
    }

    #[test]
    fn pubsub_topics() {
        assert_eq!(route_channel("general"), "websocket:route:general");
        assert_eq!(direct_channel("n1"), "websocket:direct:n1");
        assert_eq!(BROADCAST_CHANNEL, "websocket:broadcast:all");
    }
}
