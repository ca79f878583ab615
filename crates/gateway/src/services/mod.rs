//! Fan-out services: pure consumers of the message router.
//!
//! Each service owns its own in-memory per-channel state and validation
//! rules, and replies through the router. The set of services is closed at
//! startup; the ingress dispatcher routes `{service, action}` frames to
//! the table built from `ENABLED_SERVICES`.

pub mod chat;
pub mod cursor;
pub mod presence;
pub mod reaction;

use crate::protocol::ServerFrame;
use crate::registry::ClientId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub use chat::ChatService;
pub use cursor::CursorService;
pub use presence::PresenceService;
pub use reaction::ReactionService;

/// Maximum length of a logical channel name, in characters.
pub const MAX_CHANNEL_LEN: usize = 50;

/// Common capability implemented by every fan-out service.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name as addressed by clients.
    fn name(&self) -> &'static str;

    /// Handle one client action. Returns the response frame for the
    /// caller, or `None` when the action intentionally produces no reply
    /// (throttled cursor updates).
    async fn handle_action(&self, client_id: ClientId, action: &str, data: Value)
        -> Option<ServerFrame>;

    /// Invoked when a client enters DRAINING, before it leaves the
    /// directory.
    async fn on_client_disconnect(&self, _client_id: ClientId) {}

    /// Service-local state counters for the stats endpoint.
    fn stats(&self) -> Value {
        json!({})
    }
}

/// Validate a channel name. Returns an error message when invalid.
pub fn validate_channel_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some("channel name must not be empty".to_string());
    }
    if name.chars().count() > MAX_CHANNEL_LEN {
        return Some(format!("channel name exceeds {} characters", MAX_CHANNEL_LEN));
    }
    None
}

/// Deserialize action data into its typed form, shaping the input-error
/// frame on mismatch.
pub(crate) fn parse_data<T: DeserializeOwned>(
    service: &str,
    action: &str,
    data: Value,
) -> Result<T, Box<ServerFrame>> {
    serde_json::from_value(data)
        .map_err(|e| Box::new(ServerFrame::err(service, action, format!("invalid request: {}", e))))
}
