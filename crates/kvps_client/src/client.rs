//! Command/publish side of the KVPS.
//!
//! Wraps a single multiplexed connection with bounded response timeouts so
//! a stalled store can never hang an ingress task.

use crate::error::Result;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Response timeout applied to every command.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the initial connection handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Command and publish connection to the shared store.
///
/// Cheap to clone; all clones share the one multiplexed connection.
#[derive(Clone)]
pub struct KvpsClient {
    conn: MultiplexedConnection,
}

impl KvpsClient {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to KVPS at {}", url);
        let client = redis::Client::open(url)?;
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(RESPONSE_TIMEOUT, CONNECT_TIMEOUT)
            .await?;
        Ok(Self { conn })
    }

    // =========================================================================
    // String operations
    // =========================================================================

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    // =========================================================================
    // Hash operations
    // =========================================================================

    /// Set several fields of a hash at once. Values must already be strings;
    /// complex values are JSON-encoded by the caller.
    pub async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    // =========================================================================
    // Set operations
    // =========================================================================

    pub async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    pub async fn set_card(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let card: u64 = conn.scard(key).await?;
        Ok(card)
    }

    // =========================================================================
    // Expiration and pub/sub
    // =========================================================================

    /// Set a TTL in seconds on `key`.
    pub async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, seconds).await?;
        Ok(())
    }

    /// Publish `payload` on a pub/sub channel. Fire-and-forget: the number
    /// of receivers is not reported back to callers.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }
}
