//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::mesh::ClusterConfig;
use crate::registry::DuplicatePolicy;
use crate::store::{DEFAULT_PREFIX, DEFAULT_TIMEOUT};

/// Main configuration for the Gatekeeper engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Engine behaviour
    #[serde(default)]
    pub engine: EngineConfig,

    /// Counter store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Declarative rule file to load at startup
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// What happens when a rule name is registered twice
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Namespace prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single counter store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local, exact counts
    #[default]
    Memory,
    /// Shared across nodes over chitchat gossip, approximate counts
    Gossip,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Unique node identifier; generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    /// The address to listen on for gossip
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// The address to advertise to other nodes; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to bootstrap cluster membership
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes must share a cluster id to gossip
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period_secs")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_period_secs: default_dead_node_grace_period_secs(),
        }
    }
}

impl StoreConfig {
    /// Cluster settings for a gossip-backed store.
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_id: self
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "gatekeeper".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_period_secs() -> u64 {
    3600
}

impl GatekeeperConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::config(format!("Failed to parse configuration: {}", e)))?;
        if config.engine.store_timeout_ms == 0 {
            return Err(GatekeeperError::config("store_timeout_ms must be at least 1"));
        }
        Ok(config)
    }
}
