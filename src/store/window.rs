//! Fixed-window counting on top of the [`Cache`] facade.
//!
//! Windows are aligned to the epoch: a window of length `period` covers
//! `[k * period, (k + 1) * period)`. A burst straddling a boundary is split
//! across two windows; this is accepted in exchange for one counter per key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::cache::Cache;
use crate::error::StoreError;

/// Named time windows for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

impl From<TimeWindow> for Duration {
    fn from(window: TimeWindow) -> Self {
        window.duration()
    }
}

/// Counter key partitioning counts per rule and per discriminator value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub rule: String,
    pub discriminator: String,
}

impl WindowKey {
    pub fn new(rule: &str, discriminator: &str) -> Self {
        Self {
            rule: rule.to_string(),
            discriminator: discriminator.to_string(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule, self.discriminator)
    }
}

/// Fixed-window counter shared by every counting matcher.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    cache: Arc<Cache>,
}

impl WindowCounter {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Record one event in the current window and return the window's count.
    pub async fn count(&self, key: &WindowKey, period: Duration) -> Result<u64, StoreError> {
        self.cache.count(&key.to_string(), period).await
    }

    /// Current window's count without recording an event.
    pub async fn peek(&self, key: &WindowKey, period: Duration) -> Result<u64, StoreError> {
        Ok(self
            .cache
            .read_count(&key.to_string(), period)
            .await?
            .unwrap_or(0))
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::clock::ManualClock;

    fn counter_at(start: u64) -> (Arc<ManualClock>, WindowCounter) {
        let clock = Arc::new(ManualClock::new(start));
        let cache = Arc::new(Cache::memory(clock.clone()));
        (clock, WindowCounter::new(cache))
    }

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(Duration::from(TimeWindow::Hour), Duration::from_secs(3600));
        assert_eq!(Duration::from(TimeWindow::Day), Duration::from_secs(86400));
    }

    #[test]
    fn test_window_key_format() {
        let key = WindowKey::new("req_limit", "1.2.3.4");
        assert_eq!(key.to_string(), "req_limit:1.2.3.4");
    }

    #[tokio::test]
    async fn test_discriminators_do_not_interfere() {
        let (_, counter) = counter_at(6_000);
        let period = Duration::from_secs(60);
        let client1 = WindowKey::new("ruleA", "client1");
        let client2 = WindowKey::new("ruleA", "client2");

        counter.count(&client1, period).await.unwrap();
        counter.count(&client1, period).await.unwrap();
        counter.count(&client2, period).await.unwrap();

        assert_eq!(counter.peek(&client1, period).await.unwrap(), 2);
        assert_eq!(counter.peek(&client2, period).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_peek_defaults_to_zero() {
        let (_, counter) = counter_at(6_000);
        let key = WindowKey::new("logins", "alice");
        assert_eq!(counter.peek(&key, Duration::from_secs(300)).await.unwrap(), 0);
        assert_eq!(counter.peek(&key, Duration::from_secs(300)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_never_decreases_within_window() {
        let (clock, counter) = counter_at(6_000);
        let period = Duration::from_secs(60);
        let key = WindowKey::new("r", "d");

        let mut last = 0;
        for _ in 0..10 {
            let count = counter.count(&key, period).await.unwrap();
            assert!(count > last);
            last = count;
            clock.advance(Duration::from_secs(5));
        }
        assert_eq!(last, 10);
    }
}
