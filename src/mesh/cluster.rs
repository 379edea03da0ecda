//! Cluster management using Chitchat.
//!
//! Each node publishes its own contribution to every counter in its chitchat
//! key-value state; the cluster-wide count is the sum over live nodes.
//! Entries carry an absolute expiry so that windows age out on every node
//! without coordination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    pub gossip_interval: Duration,
    /// Grace period before a dead node's state is deleted.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "gatekeeper".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// One node's contribution to a counter, as stored in chitchat.
///
/// Encoded as `"{count}:{expires_at}"` with `expires_at` in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CounterEntry {
    pub count: u64,
    pub expires_at: u64,
}

impl CounterEntry {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.count, self.expires_at)
    }

    pub fn decode(value: &str) -> Option<Self> {
        let (count, expires_at) = value.split_once(':')?;
        Some(Self {
            count: count.parse().ok()?,
            expires_at: expires_at.parse().ok()?,
        })
    }

    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

fn chitchat_key(key: &str) -> String {
    format!("counter|{}", key)
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    node_id: String,
    handle: ChitchatHandle,
    /// Counters this node has written, with their expiry
    owned: parking_lot::Mutex<HashMap<String, u64>>,
    last_prune: AtomicU64,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("owned_keys", &self.owned.lock().len())
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started");

        Ok(Self {
            node_id: config.node_id,
            handle,
            owned: parking_lot::Mutex::new(HashMap::new()),
            last_prune: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Add `amount` to this node's share of `key` and return the cluster total.
    ///
    /// An expired share restarts from zero. The share's expiry is refreshed
    /// to `now + ttl`.
    pub async fn increment_counter(&self, key: &str, amount: u64, ttl: Duration, now: u64) -> u64 {
        let chitchat_key = chitchat_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(|value| CounterEntry::decode(value))
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.count);

        let entry = CounterEntry {
            count: current + amount,
            expires_at: now.saturating_add(ttl.as_secs().max(1)),
        };
        chitchat.self_node_state().set(&chitchat_key, entry.encode());
        self.owned.lock().insert(chitchat_key.clone(), entry.expires_at);

        debug!(key = %chitchat_key, local_value = entry.count, "Incremented local counter");

        if self.last_prune.swap(now, Ordering::Relaxed) < now {
            self.prune_locked(&mut chitchat, now);
        }
        sum_live(&chitchat, &chitchat_key, now).unwrap_or(0)
    }

    /// The cluster total for `key`, or `None` if no live node holds a live share.
    pub async fn get_count(&self, key: &str, now: u64) -> Option<u64> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        sum_live(&chitchat, &chitchat_key(key), now)
    }

    /// Delete this node's expired shares from gossip state.
    pub async fn prune_expired(&self, now: u64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        self.prune_locked(&mut chitchat, now)
    }

    fn prune_locked(&self, chitchat: &mut chitchat::Chitchat, now: u64) -> usize {
        let expired: Vec<String> = {
            let mut owned = self.owned.lock();
            let expired: Vec<String> = owned
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                owned.remove(key);
            }
            expired
        };

        let node_state = chitchat.self_node_state();
        for key in &expired {
            node_state.delete(key);
        }
        if !expired.is_empty() {
            trace!(pruned = expired.len(), "Pruned expired counters");
        }
        expired.len()
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Sum the live shares of `key` across live nodes.
fn sum_live(chitchat: &chitchat::Chitchat, key: &str, now: u64) -> Option<u64> {
    let mut total = None;
    for node_id in chitchat.live_nodes() {
        let entry = chitchat
            .node_state(node_id)
            .and_then(|state| state.get(key))
            .and_then(|value| CounterEntry::decode(value))
            .filter(|entry| entry.is_live(now));
        if let Some(entry) = entry {
            *total.get_or_insert(0) += entry.count;
        }
    }
    total
}
