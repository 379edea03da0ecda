//! Counter backend shared across nodes over gossip.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::cluster::{Cluster, ClusterConfig, ClusterError};
use crate::error::StoreError;
use crate::store::{Capability, Clock, CounterBackend, SystemClock};

/// A [`CounterBackend`] over a chitchat [`Cluster`].
///
/// Increments are exact within one node. Across nodes a count reflects
/// peers' shares as of the last gossip round, so a burst spread over several
/// nodes can briefly exceed a limit.
#[derive(Debug, Clone)]
pub struct GossipStore {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
}

impl GossipStore {
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self { cluster, clock }
    }

    /// Start a cluster node and wrap it, using the system clock.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        let cluster = Cluster::start(config).await?;
        Ok(Self::new(Arc::new(cluster), Arc::new(SystemClock)))
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

#[async_trait]
impl CounterBackend for GossipStore {
    fn capability(&self) -> Capability {
        Capability::Approximate
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_secs();
        Ok(self.cluster.increment_counter(key, 1, ttl, now).await)
    }

    async fn read(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_secs();
        Ok(self.cluster.get_count(key, now).await)
    }
}
