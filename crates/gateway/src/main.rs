//! Gateway node entry point.
//!
//! Real-time WebSocket gateway fanning events out across a cluster of
//! nodes through a shared KVPS directory and pub/sub fabric.

use anyhow::Result;
use gateway::registry::CLOSE_GOING_AWAY;
use gateway::services::{ChatService, CursorService, PresenceService, ReactionService, Service};
use gateway::{create_router, AppState, Config, ConnectionRegistry, Dispatcher, MessageRouter, NodeManager};
use kvps_client::{KvpsClient, KvpsSubscriber};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize logging; RUST_LOG overrides LOG_LEVEL.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("Starting gateway node");
    config.log();

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect both KVPS roles. Failure is soft: the node runs standalone.
    let (kvps, subscriber) = match KvpsClient::connect(&config.kvps_url).await {
        Ok(client) => match KvpsSubscriber::connect(&config.kvps_url).await {
            Ok(sub) => (Some(client), Some(Arc::new(sub))),
            Err(e) => {
                warn!("KVPS subscriber unavailable ({}); running standalone", e);
                (None, None)
            }
        },
        Err(e) => {
            warn!("KVPS unreachable ({}); running standalone", e);
            (None, None)
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let node = Arc::new(NodeManager::new(config.port, kvps.clone(), registry.clone()));
    node.register().await;
    info!("Node id: {}", node.node_id());

    let router = MessageRouter::new(
        node.clone(),
        registry.clone(),
        kvps,
        subscriber.clone(),
    );
    if let Err(e) = router.start().await {
        warn!("Router subscriptions failed ({}); local routing only", e);
    }

    // The service table is closed at startup.
    let mut services: Vec<Arc<dyn Service>> = Vec::new();
    let mut sweepers: Vec<JoinHandle<()>> = Vec::new();
    for name in &config.enabled_services {
        match name.as_str() {
            "chat" => services.push(ChatService::new(router.clone(), registry.clone())),
            "presence" => {
                let presence = PresenceService::new(router.clone());
                sweepers.push(presence.clone().spawn_sweeper());
                services.push(presence);
            }
            "cursor" => {
                let cursor = CursorService::new(router.clone());
                sweepers.push(cursor.clone().spawn_sweeper());
                services.push(cursor);
            }
            "reaction" => services.push(ReactionService::new(router.clone())),
            other => warn!("Ignoring unknown service '{}'", other),
        }
    }
    let dispatcher = Arc::new(Dispatcher::new(services));
    info!("Enabled services: {}", dispatcher.service_names().join(","));

    let state = Arc::new(AppState {
        registry: registry.clone(),
        router,
        node: node.clone(),
        dispatcher,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // The shutdown future closes every client with 1001 so the open
    // WebSocket connections drain and serve() can return.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await?;

    info!("Cleaning up cluster state...");
    let cleanup = async {
        for handle in &sweepers {
            handle.abort();
        }
        node.shutdown().await;
        if let Some(sub) = &subscriber {
            sub.close();
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), cleanup).await.is_err() {
        warn!("Shutdown deadline exceeded");
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(registry: Arc<ConnectionRegistry>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }

    for conn in registry.all() {
        conn.request_close(CLOSE_GOING_AWAY);
    }
}
