//! Horizontally scalable WebSocket gateway with a distributed routing core.
//!
//! This service:
//! - Accepts WebSocket connections and dispatches `{service, action}` frames
//! - Maintains the shared cluster directory (nodes, clients, channels)
//! - Routes logical sends to the minimum set of nodes over KVPS pub/sub
//! - Hosts the chat, presence, cursor, and reaction fan-out services
//!
//! ## Architecture
//!
//! ```text
//! client frames → Dispatcher → Services (chat/presence/cursor/reaction)
//!                                  ↓
//!                            MessageRouter
//!                            ↙          ↘
//!                 ConnectionRegistry   KVPS pub/sub (route/direct/broadcast)
//!                      (local)              ↕ directory (NodeManager)
//! ```
//!
//! Cross-node delivery is best effort. A node whose KVPS is unreachable
//! runs standalone: routing degrades to local-only fan-out.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod services;
pub mod ws_server;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{GatewayError, Result};
pub use node::{ClusterInfo, NodeManager};
pub use protocol::{ClientRequest, ConnectionFrame, ServerFrame};
pub use registry::{ClientConnection, ClientId, ConnectionRegistry};
pub use router::{MessageRouter, RouteEnvelope, RouteKind};
pub use services::{ChatService, CursorService, PresenceService, ReactionService, Service};
pub use ws_server::{create_router, AppState};
