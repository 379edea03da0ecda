//! Peer mesh networking using Chitchat.
//!
//! Nodes gossip their counter shares so that rules can be enforced across a
//! fleet without a central store.

mod cluster;
mod store;

pub use cluster::{Cluster, ClusterConfig, ClusterError};
pub use store::GossipStore;
