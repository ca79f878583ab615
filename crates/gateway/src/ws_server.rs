//! WebSocket server and operational HTTP surface, using Axum.

use crate::dispatch::Dispatcher;
use crate::node::NodeManager;
use crate::protocol::{ConnectionFrame, ServerFrame};
use crate::registry::{
    ClientConnection, ConnectionRegistry, CLOSE_GOING_AWAY, CLOSE_TRY_AGAIN_LATER,
    EGRESS_QUEUE_CAP,
};
use crate::router::MessageRouter;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub node: Arc<NodeManager>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Create the HTTP+WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/cluster", get(cluster_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "nodeId": state.node.node_id(),
        "standalone": state.node.is_standalone(),
        "clients": state.registry.client_count(),
    }))
}

async fn cluster_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.get_cluster_info().await)
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "nodeId": state.node.node_id(),
        "clients": state.registry.client_count(),
        "channels": state.registry.channel_count(),
        "routeSubscriptions": state.router.route_subscription_count().await,
        "services": state.dispatcher.stats(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let metadata = connect_metadata(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, metadata))
}

fn connect_metadata(headers: &HeaderMap) -> serde_json::Value {
    match headers.get("user-agent").and_then(|v| v.to_str().ok()) {
        Some(ua) => json!({"userAgent": ua}),
        None => json!({}),
    }
}

fn close_reason(code: u16) -> &'static str {
    match code {
        CLOSE_GOING_AWAY => "server shutting down",
        CLOSE_TRY_AGAIN_LATER => "try again later",
        _ => "",
    }
}

/// Drive one client connection through its lifecycle:
/// accept → registered → active → draining → gone.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, metadata: serde_json::Value) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded egress queue; overflow disconnects the client instead of
    // blocking the router's inbound dispatch.
    let (tx, mut rx) = mpsc::channel::<Message>(EGRESS_QUEUE_CAP);
    let (conn, mut close_rx) = ClientConnection::new(tx, metadata);
    let client_id = conn.id;

    state.router.register_local_client(conn.clone()).await;
    info!("Client {} connected", client_id);

    // Exactly one connection frame on accept.
    let hello = ConnectionFrame::new(
        client_id,
        state.node.node_id(),
        state.dispatcher.service_names(),
    );
    if let Ok(frame) = serde_json::to_string(&hello) {
        let _ = conn.send_text(frame);
    }

    // Writer task: the only place that touches the wire egress.
    let mut writer_close = close_rx.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if ws_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                changed = writer_close.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let code = *writer_close.borrow();
                    if let Some(code) = code {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: close_reason(code).into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
    });

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Ingress loop.
    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(frame) = state.dispatcher.dispatch(client_id, text.as_str()).await {
                            if !conn.send_frame(&frame) {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => {
                                if let Some(frame) = state.dispatcher.dispatch(client_id, text).await {
                                    if !conn.send_frame(&frame) {
                                        break;
                                    }
                                }
                            }
                            Err(_) => {
                                let _ = conn.send_frame(&ServerFrame::protocol_error(
                                    "frames must be UTF-8 JSON",
                                ));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if !conn.send_message(Message::Pong(data)) {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            // Forced close: shutdown (1001) or egress overflow (1013).
            _ = close_rx.changed() => {
                break;
            }

            _ = ping_interval.tick() => {
                if !conn.send_message(Message::Ping(vec![].into())) {
                    break;
                }
            }
        }
    }

    // DRAINING: service hooks first, then the directory.
    state.dispatcher.client_disconnected(client_id).await;
    state.router.unregister_local_client(&client_id).await;
    drop(conn);

    // Let the writer flush a pending close frame before tearing it down.
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    counter!("gateway_disconnections_total").increment(1);
    info!("Client {} disconnected", client_id);
}
