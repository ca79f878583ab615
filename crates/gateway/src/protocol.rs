//! Client-facing protocol message types.
//!
//! Every WebSocket frame is a UTF-8 JSON object. Requests carry
//! `{service, action, ...}`; responses share the uniform
//! `{type, action, success?, data?, error?, timestamp}` shape.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current time as an ISO-8601 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Client → Server
// ============================================================================

/// Request envelope sent by clients. Action-specific fields are collected
/// into `data` and deserialized by the owning service.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// Target service name.
    pub service: String,
    /// Service action.
    pub action: String,
    /// Remaining action-specific fields.
    #[serde(flatten)]
    pub data: Value,
}

// ============================================================================
// Server → Client
// ============================================================================

/// Uniform response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    /// Originating service, `"connection"`, or `"error"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ServerFrame {
    /// Successful service response.
    pub fn ok(service: &str, action: &str, data: Value) -> Self {
        Self {
            kind: service.to_string(),
            action: Some(action.to_string()),
            success: Some(true),
            data: Some(data),
            error: None,
            timestamp: now_iso(),
        }
    }

    /// Failed service response; the connection stays open.
    pub fn err(service: &str, action: &str, message: impl Into<String>) -> Self {
        Self {
            kind: service.to_string(),
            action: Some(action.to_string()),
            success: Some(false),
            data: None,
            error: Some(message.into()),
            timestamp: now_iso(),
        }
    }

    /// Top-level error frame for requests that never reached a service.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            action: None,
            success: Some(false),
            data: None,
            error: Some(message.into()),
            timestamp: now_iso(),
        }
    }

    /// Serialize to the wire string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","error":"serialization failure"}"#.to_string())
    }
}

/// The single frame sent immediately after a successful accept.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub client_id: Uuid,
    pub node_id: String,
    pub enabled_services: Vec<String>,
    pub timestamp: String,
}

impl ConnectionFrame {
    pub fn new(client_id: Uuid, node_id: &str, enabled_services: Vec<String>) -> Self {
        Self {
            kind: "connection".to_string(),
            status: "connected".to_string(),
            client_id,
            node_id: node_id.to_string(),
            enabled_services,
            timestamp: now_iso(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_collects_extra_fields() {
        let raw = r#"{"service":"chat","action":"send","channel":"g","message":"hi"}"#;
        let req: ClientRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.service, "chat");
        assert_eq!(req.action, "send");
        assert_eq!(req.data["channel"], "g");
        assert_eq!(req.data["message"], "hi");
    }

    #[test]
    fn request_missing_service_is_rejected() {
        let raw = r#"{"action":"send"}"#;
        assert!(serde_json::from_str::<ClientRequest>(raw).is_err());
    }

    #[test]
    fn ok_frame_shape() {
        let frame = ServerFrame::ok("chat", "join", json!({"channel": "g"}));
        let v: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["type"], "chat");
        assert_eq!(v["action"], "join");
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["channel"], "g");
        assert!(v.get("error").is_none());
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn error_frame_omits_data() {
        let frame = ServerFrame::err("cursor", "update", "position shape mismatch");
        let v: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "position shape mismatch");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn connection_frame_shape() {
        let id = Uuid::new_v4();
        let frame = ConnectionFrame::new(id, "node-1", vec!["chat".into()]);
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "connection");
        assert_eq!(v["status"], "connected");
        assert_eq!(v["clientId"], id.to_string());
        assert_eq!(v["nodeId"], "node-1");
        assert_eq!(v["enabledServices"][0], "chat");
    }
}
