//! Counter store facade.
//!
//! Normalizes every backend into one contract: fixed-window counts keyed by
//! `floor(now / period)`, unbucketed flags with their own TTL, and bounded
//! latency. A backend that cannot answer in time yields
//! [`StoreError::Timeout`]; it never reads as zero.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use super::backend::{Capability, CounterBackend};
use super::clock::{Clock, SystemClock};
use super::memory::MemoryStore;
use crate::error::StoreError;

/// Default prefix for every key written by the facade.
pub const DEFAULT_PREFIX: &str = "gatekeeper";
/// Default deadline for a single backend call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);

/// Facade over a [`CounterBackend`].
pub struct Cache {
    backend: Arc<dyn CounterBackend>,
    clock: Arc<dyn Clock>,
    prefix: String,
    timeout: Duration,
    /// Per-key locks, only used for read-then-write backends
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("capability", &self.backend.capability())
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Cache {
    /// Create a facade over `backend` using the system clock.
    pub fn new(backend: Arc<dyn CounterBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn CounterBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
            key_locks: DashMap::new(),
        }
    }

    /// A facade over a fresh [`MemoryStore`] sharing `clock`.
    pub fn memory(clock: Arc<dyn Clock>) -> Self {
        let backend = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self::with_clock(backend, clock)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn capability(&self) -> Capability {
        self.backend.capability()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Increment the current window's counter for `key` and return the new count.
    pub async fn count(&self, key: &str, period: Duration) -> Result<u64, StoreError> {
        let (bucket_key, ttl) = self.bucket(key, period);
        self.increment(&bucket_key, ttl).await
    }

    /// Read the current window's counter for `key` without incrementing it.
    pub async fn read_count(&self, key: &str, period: Duration) -> Result<Option<u64>, StoreError> {
        let (bucket_key, _) = self.bucket(key, period);
        self.bounded(self.backend.read(&bucket_key)).await
    }

    /// Set a flag on `key` that stays up for `ttl` from now.
    pub async fn flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let flag_key = format!("{}:{}", self.prefix, key);
        self.increment(&flag_key, ttl).await.map(|_| ())
    }

    pub async fn is_flagged(&self, key: &str) -> Result<bool, StoreError> {
        let flag_key = format!("{}:{}", self.prefix, key);
        let value = self.bounded(self.backend.read(&flag_key)).await?;
        Ok(value.unwrap_or(0) > 0)
    }

    /// Bucketed key and TTL for the window containing "now".
    ///
    /// The TTL runs to the end of the window plus one second of slack.
    fn bucket(&self, key: &str, period: Duration) -> (String, Duration) {
        let period = period.as_secs().max(1);
        let now = self.clock.now_secs();
        let bucket = now / period;
        let ttl = (period - now % period).saturating_add(1);

        (
            format!("{}:{}:{}", self.prefix, bucket, key),
            Duration::from_secs(ttl),
        )
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        if self.backend.capability() != Capability::ReadThenWrite {
            return self.bounded(self.backend.increment(key, ttl)).await;
        }

        let lock = self.key_locks.entry(key.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.bounded(self.backend.increment(key, ttl)).await
        };
        drop(lock);
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    warn!(error = %e, "Counter backend failed");
                }
                result
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Counter backend timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::clock::ManualClock;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Backend that reads, yields, then writes back: racy unless serialized.
    #[derive(Default)]
    struct RacyBackend {
        values: parking_lot::Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl CounterBackend for RacyBackend {
        fn capability(&self) -> Capability {
            Capability::ReadThenWrite
        }

        async fn increment(&self, key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            let current = self.values.lock().get(key).copied().unwrap_or(0);
            tokio::task::yield_now().await;
            let next = current + 1;
            self.values.lock().insert(key.to_string(), next);
            Ok(next)
        }

        async fn read(&self, key: &str) -> Result<Option<u64>, StoreError> {
            Ok(self.values.lock().get(key).copied())
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl CounterBackend for BrokenBackend {
        fn capability(&self) -> Capability {
            Capability::Atomic
        }

        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn read(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl CounterBackend for HangingBackend {
        fn capability(&self) -> Capability {
            Capability::Atomic
        }

        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            std::future::pending().await
        }

        async fn read(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_bucket_key_and_ttl() {
        let clock = Arc::new(ManualClock::new(6_010));
        let cache = Cache::memory(clock);

        let (key, ttl) = cache.bucket("req_limit:1.2.3.4", Duration::from_secs(60));
        assert_eq!(key, "gatekeeper:100:req_limit:1.2.3.4");
        assert_eq!(ttl, Duration::from_secs(51));
    }

    #[tokio::test]
    async fn test_count_resets_on_window_rollover() {
        let clock = Arc::new(ManualClock::new(6_000));
        let cache = Cache::memory(clock.clone());
        let period = Duration::from_secs(60);

        assert_eq!(cache.count("k", period).await.unwrap(), 1);
        assert_eq!(cache.count("k", period).await.unwrap(), 2);

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.count("k", period).await.unwrap(), 3);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.count("k", period).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_count_does_not_increment() {
        let clock = Arc::new(ManualClock::new(6_000));
        let cache = Cache::memory(clock);
        let period = Duration::from_secs(60);

        assert_eq!(cache.read_count("k", period).await.unwrap(), None);
        cache.count("k", period).await.unwrap();
        assert_eq!(cache.read_count("k", period).await.unwrap(), Some(1));
        assert_eq!(cache.read_count("k", period).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_flags_expire_independently_of_windows() {
        let clock = Arc::new(ManualClock::new(6_059));
        let cache = Cache::memory(clock.clone());

        cache.flag("ban:1.2.3.4", Duration::from_secs(600)).await.unwrap();
        assert!(cache.is_flagged("ban:1.2.3.4").await.unwrap());
        assert!(!cache.is_flagged("ban:5.6.7.8").await.unwrap());

        // Crossing a minute boundary does not lift the flag
        clock.advance(Duration::from_secs(2));
        assert!(cache.is_flagged("ban:1.2.3.4").await.unwrap());

        clock.advance(Duration::from_secs(600));
        assert!(!cache.is_flagged("ban:1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_ttl_and_period_do_not_overflow() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Cache::memory(clock.clone());

        cache.flag("fail2ban:x:ban:1.2.3.4", Duration::from_secs(u64::MAX)).await.unwrap();
        assert_eq!(cache.count("k", Duration::from_secs(u64::MAX)).await.unwrap(), 1);

        clock.advance(Duration::from_secs(1_000_000));
        assert!(cache.is_flagged("fail2ban:x:ban:1.2.3.4").await.unwrap());
        assert_eq!(cache.count("k", Duration::from_secs(u64::MAX)).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_read_then_write_backend_is_serialized() {
        let cache = Arc::new(Cache::new(Arc::new(RacyBackend::default())));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    cache.flag("shared", Duration::from_secs(60)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total = cache.bounded(cache.backend.read("gatekeeper:shared")).await.unwrap();
        assert_eq!(total, Some(400));
        assert!(cache.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let cache = Cache::new(Arc::new(BrokenBackend));
        let err = cache.count("k", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));

        let err = cache.read_count("k", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let cache = Cache::new(Arc::new(HangingBackend)).with_timeout(Duration::from_millis(10));
        let err = cache.count("k", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(t) if t == Duration::from_millis(10)));
    }
}
