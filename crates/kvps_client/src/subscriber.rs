//! Subscriber side of the KVPS.
//!
//! Owns a dedicated pub/sub connection split into a control sink and a
//! message stream. A background task drives the stream and invokes the
//! callback registered for each message's channel. Callbacks run on the
//! dispatch task and must stay non-blocking; publishes from a callback go
//! through the [`crate::KvpsClient`] command connection, never this one.

use crate::error::{KvpsError, Result};
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::PubSubSink;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with `(channel, payload)` for each inbound message.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Dedicated pub/sub connection with per-channel callbacks.
pub struct KvpsSubscriber {
    sink: Mutex<PubSubSink>,
    handlers: Arc<DashMap<String, MessageHandler>>,
    dispatch: JoinHandle<()>,
}

impl KvpsSubscriber {
    /// Open the subscriber connection and start the dispatch task.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting KVPS subscriber at {}", url);
        let client = redis::Client::open(url)?;
        let pubsub = client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();

        let handlers: Arc<DashMap<String, MessageHandler>> = Arc::new(DashMap::new());
        let dispatch_handlers = handlers.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Undecodable payload on '{}': {}", channel, e);
                        continue;
                    }
                };
                let handler = dispatch_handlers.get(&channel).map(|h| h.clone());
                match handler {
                    Some(handler) => handler(&channel, &payload),
                    None => debug!("No handler registered for '{}'", channel),
                }
            }
            warn!("KVPS subscriber stream ended");
        });

        Ok(Self {
            sink: Mutex::new(sink),
            handlers,
            dispatch,
        })
    }

    /// Subscribe to `channel`, routing its messages to `handler`.
    ///
    /// Re-subscribing replaces the previous handler for the channel.
    pub async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        if self.dispatch.is_finished() {
            return Err(KvpsError::SubscriberClosed);
        }
        self.handlers.insert(channel.to_string(), handler);
        self.sink.lock().await.subscribe(channel).await?;
        debug!("Subscribed to '{}'", channel);
        Ok(())
    }

    /// Unsubscribe from `channel` and drop its handler.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.sink.lock().await.unsubscribe(channel).await?;
        self.handlers.remove(channel);
        debug!("Unsubscribed from '{}'", channel);
        Ok(())
    }

    /// Number of channels with a registered handler.
    pub fn subscription_count(&self) -> usize {
        self.handlers.len()
    }

    /// Stop the dispatch task. Safe to call more than once.
    pub fn close(&self) {
        self.dispatch.abort();
    }
}

impl Drop for KvpsSubscriber {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}
