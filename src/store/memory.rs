//! In-process counter backend.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{Capability, CounterBackend};
use super::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: u64,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// Counter store held in a sharded concurrent map.
///
/// Increments run under the shard's write lock, so the store reports
/// [`Capability::Atomic`]. Expired entries are dropped lazily when touched.
/// Window buckets are never touched again once their window closes, so
/// increments also sweep the whole map at most once per clock second.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    last_sweep: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(self.clock.now_secs())
    }

    fn purge_at(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterBackend for MemoryStore {
    fn capability(&self) -> Capability {
        Capability::Atomic
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_secs();
        let expires_at = now.saturating_add(ttl.as_secs().max(1));

        let count = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert(Entry { count: 0, expires_at });

            if !entry.is_live(now) {
                entry.count = 0;
            }
            entry.count += 1;
            entry.expires_at = expires_at;
            entry.count
        };
        trace!(key = %key, count, expires_at, "Incremented counter");

        // The shard guard above must be released before retaining
        if self.last_sweep.swap(now, Ordering::Relaxed) < now {
            let purged = self.purge_at(now);
            if purged > 0 {
                debug!(purged, remaining = self.entries.len(), "Swept expired counters");
            }
        }

        Ok(count)
    }

    async fn read(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_secs();
        let current = self.entries.get(key).map(|entry| *entry);

        match current {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.count)),
            Some(_) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cache::Cache;
    use crate::store::clock::ManualClock;

    fn store_at(start: u64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_returns_running_count() {
        let (_, store) = store_at(1000);
        let ttl = Duration::from_secs(10);

        assert_eq!(store.increment("a", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("a", ttl).await.unwrap(), 2);
        assert_eq!(store.increment("b", ttl).await.unwrap(), 1);
        assert_eq!(store.read("a").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let (_, store) = store_at(1000);
        assert_eq!(store.read("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let (clock, store) = store_at(1000);
        let ttl = Duration::from_secs(5);

        store.increment("a", ttl).await.unwrap();
        store.increment("a", ttl).await.unwrap();

        clock.advance(Duration::from_secs(4));
        assert_eq!(store.read("a").await.unwrap(), Some(2));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.read("a").await.unwrap(), None);
        assert!(store.is_empty());

        // A fresh increment after expiry starts over
        assert_eq!(store.increment("a", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store_at(1000);

        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(100)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.read("long").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_closed_windows_are_reclaimed() {
        let clock = Arc::new(ManualClock::new(1000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let cache = Cache::with_clock(store.clone(), clock.clone());

        for _ in 0..100 {
            assert_eq!(cache.count("req_limit:1.2.3.4", Duration::from_secs(60)).await.unwrap(), 1);
            clock.advance(Duration::from_secs(60));
        }

        // Only the bucket for the most recent window survives
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_saturates() {
        let (clock, store) = store_at(1000);

        assert_eq!(store.increment("ban", Duration::from_secs(u64::MAX)).await.unwrap(), 1);
        clock.advance(Duration::from_secs(86_400 * 365));
        assert_eq!(store.read("ban").await.unwrap(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_exact() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store.increment("hot", Duration::from_secs(60)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.read("hot").await.unwrap(), Some(2000));
    }
}
