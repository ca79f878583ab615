//! Node manager: cluster identity, directory maintenance, and liveness.
//!
//! Every gateway process registers itself in the shared directory under a
//! unique node id and renews a heartbeat with a TTL so crashed nodes age
//! out on their own. All directory writes are best-effort: a failed KVPS
//! call is logged and swallowed, never fatal. When the KVPS is unreachable
//! at startup the node runs in standalone mode and every topology query
//! answers with this node alone.

use crate::error::{GatewayError, Result};
use crate::keys;
use crate::registry::{ClientId, ConnectionRegistry};
use chrono::Utc;
use kvps_client::KvpsClient;
use metrics::counter;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Networks, Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Interval between heartbeat renewals.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat key TTL; dead nodes disappear after this without cleanup.
pub const HEARTBEAT_TTL_SECS: i64 = 3 * HEARTBEAT_INTERVAL.as_secs() as i64;

/// Cluster topology snapshot for the `/cluster` endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub node_id: String,
    pub standalone: bool,
    pub total_nodes: usize,
    pub nodes: Vec<ClusterNode>,
}

/// One node's directory entries. `alive` is false when the heartbeat key
/// has expired but the node still lingers in the active set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub node_id: String,
    pub alive: bool,
    pub info: HashMap<String, String>,
    pub heartbeat: HashMap<String, String>,
}

/// This process's cluster identity and directory writer.
pub struct NodeManager {
    node_id: String,
    port: u16,
    started_at_ms: i64,
    kvps: Option<KvpsClient>,
    standalone: AtomicBool,
    registry: Arc<ConnectionRegistry>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(port: u16, kvps: Option<KvpsClient>, registry: Arc<ConnectionRegistry>) -> Self {
        let standalone = kvps.is_none();
        Self {
            node_id: generate_node_id(),
            port,
            started_at_ms: Utc::now().timestamp_millis(),
            kvps,
            standalone: AtomicBool::new(standalone),
            registry,
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone.load(Ordering::Relaxed)
    }

    /// The KVPS handle, unless this node is standalone.
    fn active_kvps(&self) -> Option<&KvpsClient> {
        if self.is_standalone() {
            None
        } else {
            self.kvps.as_ref()
        }
    }

    fn directory_error(&self, op: &str, err: GatewayError) {
        counter!("gateway_directory_errors_total").increment(1);
        warn!("Directory op '{}' failed: {}", op, err);
    }

    // =========================================================================
    // Node lifecycle
    // =========================================================================

    /// Register this node in the cluster directory and start heartbeating.
    /// Idempotent. Fails soft: on KVPS error the node enters standalone
    /// mode instead of crashing.
    pub async fn register(&self) {
        let Some(kvps) = self.kvps.as_ref() else {
            info!("No KVPS available; node {} running standalone", self.node_id);
            return;
        };

        match self.write_registration(kvps).await {
            Ok(()) => {
                self.standalone.store(false, Ordering::Relaxed);
                self.start_heartbeat();
                info!("Node {} registered in cluster directory", self.node_id);
            }
            Err(e) => {
                self.standalone.store(true, Ordering::Relaxed);
                warn!(
                    "Cluster registration failed ({}); node {} running standalone",
                    e, self.node_id
                );
            }
        }
    }

    async fn write_registration(&self, kvps: &KvpsClient) -> Result<()> {
        kvps.set_add(keys::NODES_SET, &self.node_id).await?;

        let fields = [
            ("hostname", hostname()),
            ("pid", std::process::id().to_string()),
            ("startTime", self.started_at_ms.to_string()),
            ("port", self.port.to_string()),
            ("interfaces", interface_names()),
        ];
        kvps.hash_set(&keys::node_info(&self.node_id), &fields).await?;

        let mut sys = System::new();
        publish_heartbeat(
            kvps,
            &self.node_id,
            self.started_at_ms,
            self.registry.client_count(),
            &mut sys,
        )
        .await
    }

    fn start_heartbeat(&self) {
        let mut slot = self.heartbeat_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let Some(kvps) = self.kvps.clone() else { return };
        let node_id = self.node_id.clone();
        let started_at_ms = self.started_at_ms;
        let registry = self.registry.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The registration write already carried the first heartbeat.
            interval.tick().await;
            let mut sys = System::new();
            loop {
                interval.tick().await;
                let connections = registry.client_count();
                if let Err(e) =
                    publish_heartbeat(&kvps, &node_id, started_at_ms, connections, &mut sys).await
                {
                    counter!("gateway_directory_errors_total").increment(1);
                    warn!("Heartbeat write failed: {}", e);
                }
            }
        });
        *slot = Some(handle);
    }

    /// Remove every trace of this node from the directory.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
        let Some(kvps) = self.active_kvps() else {
            return;
        };

        match kvps.set_members(&keys::node_channels(&self.node_id)).await {
            Ok(channels) => {
                for ch in channels {
                    let _ = kvps.set_remove(&keys::channel_nodes(&ch), &self.node_id).await;
                }
            }
            Err(e) => self.directory_error("shutdown:channels", e.into()),
        }

        match kvps.set_members(&keys::node_clients(&self.node_id)).await {
            Ok(clients) => {
                for c in clients {
                    let _ = kvps.delete(&keys::client_node(&c)).await;
                    let _ = kvps.delete(&keys::client_channels(&c)).await;
                    let _ = kvps.delete(&keys::client_metadata(&c)).await;
                }
            }
            Err(e) => self.directory_error("shutdown:clients", e.into()),
        }

        let _ = kvps.delete(&keys::node_info(&self.node_id)).await;
        let _ = kvps.delete(&keys::node_heartbeat(&self.node_id)).await;
        let _ = kvps.delete(&keys::node_clients(&self.node_id)).await;
        let _ = kvps.delete(&keys::node_channels(&self.node_id)).await;
        let _ = kvps.set_remove(keys::NODES_SET, &self.node_id).await;

        info!("Node {} deregistered from cluster directory", self.node_id);
    }

    // =========================================================================
    // Client directory
    // =========================================================================

    /// Record a locally accepted client in the shared directory.
    pub async fn register_client(&self, client_id: &ClientId, metadata: &Value) {
        let Some(kvps) = self.active_kvps() else { return };
        let id = client_id.to_string();

        let result: Result<()> = async {
            kvps.set(&keys::client_node(&id), &self.node_id).await?;
            kvps.set_add(&keys::node_clients(&self.node_id), &id).await?;
            if let Some(map) = metadata.as_object() {
                if !map.is_empty() {
                    let fields: Vec<(&str, String)> = map
                        .iter()
                        .map(|(k, v)| (k.as_str(), hash_value(v)))
                        .collect();
                    kvps.hash_set(&keys::client_metadata(&id), &fields).await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.directory_error("register_client", e);
        }
    }

    /// Remove every directory entry referencing a client.
    pub async fn unregister_client(&self, client_id: &ClientId) {
        let Some(kvps) = self.active_kvps() else { return };
        let id = client_id.to_string();

        let result: Result<()> = async {
            kvps.delete(&keys::client_node(&id)).await?;
            kvps.delete(&keys::client_channels(&id)).await?;
            kvps.delete(&keys::client_metadata(&id)).await?;
            kvps.set_remove(&keys::node_clients(&self.node_id), &id).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.directory_error("unregister_client", e);
        }
    }

    /// Record a (client, channel) subscription and mark this node as
    /// serving the channel.
    pub async fn subscribe_client_to_channel(&self, client_id: &ClientId, channel: &str) {
        let Some(kvps) = self.active_kvps() else { return };
        let id = client_id.to_string();

        let result: Result<()> = async {
            kvps.set_add(&keys::client_channels(&id), channel).await?;
            kvps.set_add(&keys::channel_nodes(channel), &self.node_id).await?;
            kvps.set_add(&keys::node_channels(&self.node_id), channel).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.directory_error("subscribe_client_to_channel", e);
        }
    }

    /// Inverse of [`Self::subscribe_client_to_channel`]. The node is pulled
    /// out of the channel's node set only when no other local client still
    /// subscribes to it.
    pub async fn unsubscribe_client_from_channel(&self, client_id: &ClientId, channel: &str) {
        let Some(kvps) = self.active_kvps() else { return };
        let id = client_id.to_string();

        let result: Result<()> = async {
            kvps.set_remove(&keys::client_channels(&id), channel).await?;
            if !self.registry.has_other_subscriber(channel, client_id) {
                kvps.set_remove(&keys::channel_nodes(channel), &self.node_id).await?;
                kvps.set_remove(&keys::node_channels(&self.node_id), channel).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.directory_error("unsubscribe_client_from_channel", e);
        }
    }

    // =========================================================================
    // Topology queries
    // =========================================================================

    /// Nodes currently serving at least one subscriber of `channel`.
    /// Standalone (or on directory error) this degrades to `[self]`.
    pub async fn get_nodes_for_channel(&self, channel: &str) -> Vec<String> {
        let Some(kvps) = self.active_kvps() else {
            return vec![self.node_id.clone()];
        };
        match kvps.set_members(&keys::channel_nodes(channel)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.directory_error("get_nodes_for_channel", e.into());
                vec![self.node_id.clone()]
            }
        }
    }

    /// The node owning `client_id`, if the directory knows it.
    pub async fn get_client_node(&self, client_id: &ClientId) -> Option<String> {
        let Some(kvps) = self.active_kvps() else {
            return self
                .registry
                .contains(client_id)
                .then(|| self.node_id.clone());
        };
        match kvps.get(&keys::client_node(&client_id.to_string())).await {
            Ok(node) => node,
            Err(e) => {
                self.directory_error("get_client_node", e.into());
                None
            }
        }
    }

    /// Aggregate node info and heartbeats for observability.
    pub async fn get_cluster_info(&self) -> ClusterInfo {
        let Some(kvps) = self.active_kvps() else {
            let mut info = HashMap::new();
            info.insert("hostname".to_string(), hostname());
            info.insert("pid".to_string(), std::process::id().to_string());
            info.insert("startTime".to_string(), self.started_at_ms.to_string());
            info.insert("port".to_string(), self.port.to_string());
            return ClusterInfo {
                node_id: self.node_id.clone(),
                standalone: true,
                total_nodes: 1,
                nodes: vec![ClusterNode {
                    node_id: self.node_id.clone(),
                    alive: true,
                    info,
                    heartbeat: HashMap::new(),
                }],
            };
        };

        let node_ids = match kvps.set_members(keys::NODES_SET).await {
            Ok(ids) => ids,
            Err(e) => {
                self.directory_error("get_cluster_info", e.into());
                vec![self.node_id.clone()]
            }
        };

        let mut nodes = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            let info = kvps.hash_get_all(&keys::node_info(&id)).await.unwrap_or_default();
            let heartbeat = kvps
                .hash_get_all(&keys::node_heartbeat(&id))
                .await
                .unwrap_or_default();
            // An empty heartbeat hash means the TTL fired: treat as dead.
            let alive = !heartbeat.is_empty();
            if !alive {
                debug!("Node {} has an expired heartbeat", id);
            }
            nodes.push(ClusterNode {
                node_id: id,
                alive,
                info,
                heartbeat,
            });
        }

        ClusterInfo {
            node_id: self.node_id.clone(),
            standalone: false,
            total_nodes: nodes.len(),
            nodes,
        }
    }
}

/// Write the heartbeat hash `{timestamp, uptime, connectionCount,
/// memoryUsage}` and renew its TTL.
async fn publish_heartbeat(
    kvps: &KvpsClient,
    node_id: &str,
    started_at_ms: i64,
    connection_count: usize,
    sys: &mut System,
) -> Result<()> {
    let uptime_secs = (Utc::now().timestamp_millis() - started_at_ms) / 1000;
    let fields = [
        ("timestamp", Utc::now().timestamp_millis().to_string()),
        ("uptime", uptime_secs.to_string()),
        ("connectionCount", connection_count.to_string()),
        ("memoryUsage", process_memory_bytes(sys).to_string()),
    ];
    let key = keys::node_heartbeat(node_id);
    kvps.hash_set(&key, &fields).await?;
    kvps.expire(&key, HEARTBEAT_TTL_SECS).await?;
    Ok(())
}

fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string())
}

/// Unique per-process node id: `host-pid-millis-rand`.
fn generate_node_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!(
        "{}-{}-{}-{}",
        hostname(),
        std::process::id(),
        Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}

fn process_memory_bytes(sys: &mut System) -> u64 {
    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}

fn interface_names() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut names: Vec<String> = networks.iter().map(|(name, _)| name.clone()).collect();
    names.sort();
    names.join(",")
}

/// Hash values must be strings; anything structured is JSON-encoded.
fn hash_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientConnection;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn standalone_manager() -> (Arc<NodeManager>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let manager = Arc::new(NodeManager::new(8080, None, registry.clone()));
        (manager, registry)
    }

    #[test]
    fn node_id_has_expected_parts() {
        let id = generate_node_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert!(parts.len() >= 4);
        assert_eq!(parts[parts.len() - 1].len(), 4);
        assert!(parts[parts.len() - 2].parse::<i64>().is_ok());
        assert!(parts[parts.len() - 3].parse::<u32>().is_ok());
    }

    #[test]
    fn hash_value_encoding() {
        assert_eq!(hash_value(&json!("plain")), "plain");
        assert_eq!(hash_value(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(hash_value(&json!(7)), "7");
    }

    #[tokio::test]
    async fn standalone_topology_answers_self() {
        let (manager, registry) = standalone_manager();
        manager.register().await;
        assert!(manager.is_standalone());

        let nodes = manager.get_nodes_for_channel("anything").await;
        assert_eq!(nodes, vec![manager.node_id().to_string()]);

        let (tx, _rx) = mpsc::channel(8);
        let (conn, _close) = ClientConnection::new(tx, json!({}));
        let id = registry.register(conn);

        assert_eq!(
            manager.get_client_node(&id).await,
            Some(manager.node_id().to_string())
        );
        let unknown = uuid::Uuid::new_v4();
        assert_eq!(manager.get_client_node(&unknown).await, None);
    }

    #[tokio::test]
    async fn standalone_cluster_info_reports_one_node() {
        let (manager, _registry) = standalone_manager();
        manager.register().await;
        let info = manager.get_cluster_info().await;
        assert!(info.standalone);
        assert_eq!(info.total_nodes, 1);
        assert_eq!(info.nodes[0].node_id, manager.node_id());
        assert!(info.nodes[0].alive);
    }

    #[tokio::test]
    async fn standalone_directory_writes_are_noops() {
        let (manager, _registry) = standalone_manager();
        manager.register().await;
        let id = uuid::Uuid::new_v4();
        // Must not panic or error without a KVPS.
        manager.register_client(&id, &json!({"ua": "test"})).await;
        manager.subscribe_client_to_channel(&id, "general").await;
        manager.unsubscribe_client_from_channel(&id, "general").await;
        manager.unregister_client(&id).await;
        manager.shutdown().await;
    }
}
