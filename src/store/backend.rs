//! Counter backend trait for abstracting local and distributed stores.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// How far a backend can be trusted to count exactly under concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// `increment` is a single atomic operation; the facade passes calls straight through.
    Atomic,
    /// `increment` reads and then writes; the facade serializes increments per key.
    ReadThenWrite,
    /// Counts converge eventually (e.g. gossip across nodes) and may briefly under-count.
    Approximate,
}

/// Trait for counter store implementations.
///
/// Keys are opaque strings. Expiry is owned by the backend: an entry whose
/// TTL has elapsed must read as absent and restart from zero on increment.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    fn capability(&self) -> Capability;

    /// Increment the counter at `key`, refresh its expiry to `ttl`, and return the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Read the counter at `key` without modifying it.
    async fn read(&self, key: &str) -> Result<Option<u64>, StoreError>;
}
