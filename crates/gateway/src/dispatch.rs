//! Ingress dispatcher: `{service, action}` frames → the service table.
//!
//! The table is closed at startup (built from `ENABLED_SERVICES`);
//! malformed frames and unknown services come back as uniform error
//! frames and never tear down the connection.

use crate::protocol::{ClientRequest, ServerFrame};
use crate::registry::ClientId;
use crate::services::Service;
use metrics::counter;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Dispatcher {
    services: HashMap<&'static str, Arc<dyn Service>>,
    order: Vec<&'static str>,
}

impl Dispatcher {
    pub fn new(services: Vec<Arc<dyn Service>>) -> Self {
        let mut table = HashMap::new();
        let mut order = Vec::new();
        for service in services {
            order.push(service.name());
            table.insert(service.name(), service);
        }
        Self {
            services: table,
            order,
        }
    }

    /// Enabled service names, in registration order.
    pub fn service_names(&self) -> Vec<String> {
        self.order.iter().map(|s| s.to_string()).collect()
    }

    /// Parse and route one inbound frame. Returns the frame to send back,
    /// or `None` when the action intentionally has no reply.
    pub async fn dispatch(&self, client_id: ClientId, raw: &str) -> Option<ServerFrame> {
        counter!("gateway_requests_total").increment(1);
        let request: ClientRequest = match serde_json::from_str(raw) {
            Ok(req) => req,
            Err(e) => {
                debug!("Malformed request from {}: {}", client_id, e);
                counter!("gateway_requests_rejected_total").increment(1);
                return Some(ServerFrame::protocol_error(format!("malformed request: {}", e)));
            }
        };

        let Some(service) = self.services.get(request.service.as_str()) else {
            counter!("gateway_requests_rejected_total").increment(1);
            return Some(ServerFrame::protocol_error(format!(
                "unknown service '{}'",
                request.service
            )));
        };

        service
            .handle_action(client_id, &request.action, request.data)
            .await
    }

    /// Run every service's disconnect hook for a draining client.
    pub async fn client_disconnected(&self, client_id: ClientId) {
        for name in &self.order {
            if let Some(service) = self.services.get(name) {
                service.on_client_disconnect(client_id).await;
            }
        }
    }

    /// Aggregate per-service stats.
    pub fn stats(&self) -> Value {
        let mut stats = serde_json::Map::new();
        for name in &self.order {
            if let Some(service) = self.services.get(name) {
                stats.insert(name.to_string(), service.stats());
            }
        }
        json!(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeManager;
    use crate::registry::{ClientConnection, ConnectionRegistry};
    use crate::router::MessageRouter;
    use crate::services::ChatService;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn fixture() -> (Dispatcher, ClientId) {
        let registry = Arc::new(ConnectionRegistry::new());
        let node = Arc::new(NodeManager::new(8080, None, registry.clone()));
        let router = MessageRouter::new(node, registry.clone(), None, None);
        let chat = ChatService::new(router.clone(), registry.clone());
        let dispatcher = Dispatcher::new(vec![chat as Arc<dyn Service>]);

        let (tx, _rx) = mpsc::channel(64);
        let (conn, _close) = ClientConnection::new(tx, json!({}));
        let id = conn.id;
        router.register_local_client(conn).await;
        (dispatcher, id)
    }

    #[tokio::test]
    async fn malformed_json_yields_error_frame() {
        let (dispatcher, id) = fixture().await;
        let frame = dispatcher.dispatch(id, "not json").await.unwrap();
        assert_eq!(frame.kind, "error");
        assert_eq!(frame.success, Some(false));
    }

    #[tokio::test]
    async fn unknown_service_yields_error_frame() {
        let (dispatcher, id) = fixture().await;
        let frame = dispatcher
            .dispatch(id, r#"{"service":"video","action":"start"}"#)
            .await
            .unwrap();
        assert_eq!(frame.kind, "error");
        assert!(frame.error.unwrap().contains("unknown service"));
    }

    #[tokio::test]
    async fn known_service_is_routed() {
        let (dispatcher, id) = fixture().await;
        let frame = dispatcher
            .dispatch(id, r#"{"service":"chat","action":"join","channel":"g"}"#)
            .await
            .unwrap();
        assert_eq!(frame.kind, "chat");
        assert_eq!(frame.success, Some(true));
    }

    #[tokio::test]
    async fn service_names_preserve_order() {
        let (dispatcher, _id) = fixture().await;
        assert_eq!(dispatcher.service_names(), vec!["chat".to_string()]);
    }
}
