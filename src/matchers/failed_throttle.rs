//! Failed-attempt rate limiter.
//!
//! Works in two phases. After the handler answers, [`FailedThrottle::track`]
//! counts the response if its status falls outside the ok range. Before the
//! next request is dispatched, evaluation reads the count without
//! incrementing and throttles once it has reached the limit.

use async_trait::async_trait;
use std::ops::Range;
use tracing::{debug, trace};

use super::discriminator::resolve_period;
use super::throttle::ThrottleOptions;
use super::{Context, Discriminator, Limit, Matcher, Period};
use crate::error::{GatekeeperError, Result};
use crate::request::{MatchRecord, MatchType, Request, ThrottleData};
use crate::store::WindowKey;

/// Statuses that do not count as failures unless configured otherwise.
pub const DEFAULT_OK_CODES: Range<u16> = 200..300;

/// Options for a failed-attempt limiter. `limit` and `period` are mandatory.
#[derive(Debug, Clone, Default)]
pub struct FailedThrottleOptions {
    pub throttle: ThrottleOptions,
    /// Half-open range of statuses that are not failures
    pub ok_codes: Option<Range<u16>>,
    /// Label reported in match metadata instead of `failed_throttle`
    pub match_type: Option<String>,
}

impl FailedThrottleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: impl Into<Limit>) -> Self {
        self.throttle = self.throttle.limit(limit);
        self
    }

    pub fn period(mut self, period: impl Into<Period>) -> Self {
        self.throttle = self.throttle.period(period);
        self
    }

    pub fn ok_codes(mut self, codes: Range<u16>) -> Self {
        self.ok_codes = Some(codes);
        self
    }

    pub fn match_type(mut self, label: impl Into<String>) -> Self {
        self.match_type = Some(label.into());
        self
    }
}

/// Throttles a discriminator after `limit` failed responses within `period`.
#[derive(Debug, Clone)]
pub struct FailedThrottle {
    name: String,
    discriminator: Discriminator,
    limit: Limit,
    period: Period,
    ok_codes: Range<u16>,
    match_type: MatchType,
}

impl FailedThrottle {
    pub fn new(
        name: impl Into<String>,
        options: FailedThrottleOptions,
        discriminator: Discriminator,
    ) -> Result<Self> {
        let name = name.into();
        let (limit, period) = options.throttle.validate(&name)?;
        let ok_codes = options.ok_codes.unwrap_or(DEFAULT_OK_CODES);
        if ok_codes.is_empty() {
            return Err(GatekeeperError::config(format!(
                "rule '{}': ok_codes range {:?} is empty",
                name, ok_codes
            )));
        }

        Ok(Self {
            name,
            discriminator,
            limit,
            period,
            ok_codes,
            match_type: options
                .match_type
                .map(MatchType::Custom)
                .unwrap_or(MatchType::FailedThrottle),
        })
    }

    /// Record the handler's response for `req`.
    ///
    /// Returns the new failure count, or `None` when the response was not
    /// counted (rule does not apply, or the status is in the ok range).
    pub async fn track(&self, req: &Request, status: u16, ctx: &Context) -> Result<Option<u64>> {
        let Some(discriminator) = self.discriminator.resolve(&self.name, req)? else {
            return Ok(None);
        };
        if self.ok_codes.contains(&status) {
            trace!(rule = %self.name, status, "Response within ok codes, not counted");
            return Ok(None);
        }

        let period = resolve_period(&self.name, &self.period, req)?;
        let key = WindowKey::new(&self.name, &discriminator);
        let count = ctx.counter().count(&key, period).await?;

        debug!(key = %key, status, count, "Counted failed response");
        Ok(Some(count))
    }

    pub fn ok_codes(&self) -> &Range<u16> {
        &self.ok_codes
    }
}

#[async_trait]
impl Matcher for FailedThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_type(&self) -> MatchType {
        self.match_type.clone()
    }

    async fn matches(&self, req: &mut Request, ctx: &Context) -> Result<bool> {
        let Some(discriminator) = self.discriminator.resolve(&self.name, req)? else {
            return Ok(false);
        };

        let period = resolve_period(&self.name, &self.period, req)?;
        let limit = self.limit.resolve(req);
        let key = WindowKey::new(&self.name, &discriminator);

        let count = ctx.counter().peek(&key, period).await?;
        let throttled = count >= limit;

        trace!(key = %key, count, limit, throttled, "Evaluated failed throttle");

        if throttled {
            let data = ThrottleData { count, period, limit };
            req.annotations_mut()
                .failed_throttle_data
                .insert(self.name.clone(), data);
            ctx.record_match(
                req,
                MatchRecord {
                    rule: self.name.clone(),
                    discriminator,
                    match_type: self.match_type.clone(),
                    data: Some(data),
                },
            );
        }
        Ok(throttled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Cache, ManualClock};
    use std::sync::Arc;
    use std::time::Duration;

    fn context_at(start: u64) -> (Arc<ManualClock>, Context) {
        let clock = Arc::new(ManualClock::new(start));
        let cache = Arc::new(Cache::memory(clock.clone()));
        (clock, Context::new(cache))
    }

    fn logins() -> FailedThrottle {
        FailedThrottle::new(
            "logins",
            FailedThrottleOptions::new()
                .limit(3)
                .period(Duration::from_secs(300))
                .ok_codes(200..300),
            Discriminator::remote_addr(),
        )
        .unwrap()
    }

    fn login_from(addr: &str) -> Request {
        Request::new("POST", "/login").with_remote_addr(addr)
    }

    #[tokio::test]
    async fn test_throttles_after_limit_failures() {
        let (_, ctx) = context_at(6_000);
        let rule = logins();

        for expected in 1..=3 {
            let count = rule.track(&login_from("1.2.3.4"), 401, &ctx).await.unwrap();
            assert_eq!(count, Some(expected));
        }

        let mut fourth = login_from("1.2.3.4");
        assert!(rule.matches(&mut fourth, &ctx).await.unwrap());

        let data = fourth.annotations().failed_throttle_data["logins"];
        assert_eq!(data.count, 3);
        assert_eq!(data.limit, 3);
        assert_eq!(data.period, Duration::from_secs(300));

        let matched = fourth.annotations().matched.clone().unwrap();
        assert_eq!(matched.match_type, MatchType::FailedThrottle);
        assert_eq!(matched.data, Some(data));
    }

    #[tokio::test]
    async fn test_below_limit_is_not_throttled_and_does_not_count() {
        let (_, ctx) = context_at(6_000);
        let rule = logins();

        rule.track(&login_from("1.2.3.4"), 401, &ctx).await.unwrap();
        rule.track(&login_from("1.2.3.4"), 403, &ctx).await.unwrap();

        for _ in 0..5 {
            let mut req = login_from("1.2.3.4");
            assert!(!rule.matches(&mut req, &ctx).await.unwrap());
            assert!(req.annotations().failed_throttle_data.is_empty());
        }
    }

    #[tokio::test]
    async fn test_ok_codes_are_not_counted() {
        let (_, ctx) = context_at(6_000);
        let rule = logins();

        for status in [200, 201, 204, 299] {
            assert_eq!(rule.track(&login_from("1.2.3.4"), status, &ctx).await.unwrap(), None);
        }
        // The upper bound is exclusive
        assert_eq!(rule.track(&login_from("1.2.3.4"), 300, &ctx).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_custom_ok_codes_and_type() {
        let (_, ctx) = context_at(6_000);
        let rule = FailedThrottle::new(
            "api",
            FailedThrottleOptions::new()
                .limit(1)
                .period(Duration::from_secs(60))
                .ok_codes(200..500)
                .match_type("api_abuse"),
            Discriminator::remote_addr(),
        )
        .unwrap();

        assert_eq!(rule.track(&login_from("a"), 404, &ctx).await.unwrap(), None);
        assert_eq!(rule.track(&login_from("a"), 503, &ctx).await.unwrap(), Some(1));

        let mut req = login_from("a");
        assert!(rule.matches(&mut req, &ctx).await.unwrap());
        assert_eq!(
            req.annotations().matched.as_ref().unwrap().match_type,
            MatchType::Custom("api_abuse".into())
        );
    }

    #[tokio::test]
    async fn test_absent_discriminator_is_ignored() {
        let (_, ctx) = context_at(6_000);
        let rule = logins();
        let mut anonymous = Request::new("POST", "/login");

        assert_eq!(rule.track(&anonymous, 401, &ctx).await.unwrap(), None);
        assert!(!rule.matches(&mut anonymous, &ctx).await.unwrap());
        assert!(anonymous.annotations().matched.is_none());
    }

    #[tokio::test]
    async fn test_failures_expire_with_window() {
        let (clock, ctx) = context_at(6_000);
        let rule = logins();

        for _ in 0..3 {
            rule.track(&login_from("1.2.3.4"), 500, &ctx).await.unwrap();
        }
        assert!(rule.matches(&mut login_from("1.2.3.4"), &ctx).await.unwrap());

        clock.advance(Duration::from_secs(300));
        assert!(!rule.matches(&mut login_from("1.2.3.4"), &ctx).await.unwrap());
    }

    #[test]
    fn test_empty_ok_codes_rejected() {
        let err = FailedThrottle::new(
            "bad",
            FailedThrottleOptions::new()
                .limit(1)
                .period(Duration::from_secs(60))
                .ok_codes(300..200),
            Discriminator::remote_addr(),
        )
        .unwrap_err();
        assert!(matches!(err, GatekeeperError::Configuration(_)));
    }
}
