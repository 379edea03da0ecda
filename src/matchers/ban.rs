//! Cumulative ban rules.
//!
//! A ban rule counts "failure" events per discriminator in a `findtime`
//! window. Once `maxretry` events accumulate, the discriminator is banned for
//! `bantime`, regardless of what it does next. The ban lives under its own
//! key, so being banned does not reset the trigger count.
//!
//! - [`BanKind::Fail2Ban`] blocks every failure event as well as banned clients.
//! - [`BanKind::Allow2Ban`] lets failure events through until the ban trips.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{info, trace};

use super::discriminator::check_period;
use super::{Context, Discriminator, Matcher};
use crate::error::{GatekeeperError, Result};
use crate::request::{MatchRecord, MatchType, Request, ThrottleData};
use crate::store::WindowKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanKind {
    Fail2Ban,
    Allow2Ban,
}

impl BanKind {
    fn prefix(&self) -> &'static str {
        match self {
            BanKind::Fail2Ban => "fail2ban",
            BanKind::Allow2Ban => "allow2ban",
        }
    }

    fn match_type(&self) -> MatchType {
        match self {
            BanKind::Fail2Ban => MatchType::Fail2Ban,
            BanKind::Allow2Ban => MatchType::Allow2Ban,
        }
    }
}

impl fmt::Display for BanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanOptions {
    /// Failure events that trigger a ban
    pub maxretry: u64,
    /// Window in which failures are counted
    pub findtime: Duration,
    /// How long a ban lasts
    pub bantime: Duration,
}

impl BanOptions {
    fn validate(&self, rule: &str) -> Result<()> {
        if self.maxretry == 0 {
            return Err(GatekeeperError::config(format!(
                "rule '{}': maxretry must be at least 1",
                rule
            )));
        }
        check_period(rule, self.findtime)?;
        check_period(rule, self.bantime)?;
        Ok(())
    }
}

/// A deny rule with fail2ban-style memory.
///
/// `discriminator` identifies the client; `filter` decides whether the
/// current request is a failure event.
#[derive(Debug, Clone)]
pub struct BanRule {
    name: String,
    kind: BanKind,
    discriminator: Discriminator,
    filter: Discriminator,
    options: BanOptions,
}

/// Shorthand constructors.
pub struct Fail2Ban;
pub struct Allow2Ban;

impl Fail2Ban {
    pub fn rule(
        name: impl Into<String>,
        options: BanOptions,
        discriminator: Discriminator,
        filter: Discriminator,
    ) -> Result<BanRule> {
        BanRule::new(name, BanKind::Fail2Ban, options, discriminator, filter)
    }
}

impl Allow2Ban {
    pub fn rule(
        name: impl Into<String>,
        options: BanOptions,
        discriminator: Discriminator,
        filter: Discriminator,
    ) -> Result<BanRule> {
        BanRule::new(name, BanKind::Allow2Ban, options, discriminator, filter)
    }
}

impl BanRule {
    pub fn new(
        name: impl Into<String>,
        kind: BanKind,
        options: BanOptions,
        discriminator: Discriminator,
        filter: Discriminator,
    ) -> Result<Self> {
        let name = name.into();
        options.validate(&name)?;
        Ok(Self {
            name,
            kind,
            discriminator,
            filter,
            options,
        })
    }

    pub fn kind(&self) -> BanKind {
        self.kind
    }

    fn count_key(&self, discriminator: &str) -> WindowKey {
        WindowKey::new(&format!("{}:{}:count", self.kind, self.name), discriminator)
    }

    fn ban_key(&self, discriminator: &str) -> String {
        format!("{}:{}:ban:{}", self.kind, self.name, discriminator)
    }

    /// Whether `discriminator` is currently serving a ban.
    pub async fn is_banned(&self, discriminator: &str, ctx: &Context) -> Result<bool> {
        Ok(ctx.cache().is_flagged(&self.ban_key(discriminator)).await?)
    }

    fn record(&self, req: &mut Request, ctx: &Context, discriminator: String, data: ThrottleData) {
        ctx.record_match(
            req,
            MatchRecord {
                rule: self.name.clone(),
                discriminator,
                match_type: self.kind.match_type(),
                data: Some(data),
            },
        );
    }
}

#[async_trait]
impl Matcher for BanRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_type(&self) -> MatchType {
        self.kind.match_type()
    }

    async fn matches(&self, req: &mut Request, ctx: &Context) -> Result<bool> {
        let Some(discriminator) = self.discriminator.resolve(&self.name, req)? else {
            return Ok(false);
        };
        let BanOptions {
            maxretry,
            findtime,
            bantime,
        } = self.options;
        let count_key = self.count_key(&discriminator);

        if self.is_banned(&discriminator, ctx).await? {
            trace!(rule = %self.name, discriminator = %discriminator, "Client is banned");
            let count = ctx.counter().peek(&count_key, findtime).await?;
            let data = ThrottleData {
                count,
                period: bantime,
                limit: maxretry,
            };
            self.record(req, ctx, discriminator, data);
            return Ok(true);
        }

        if self.filter.resolve(&self.name, req)?.is_none() {
            return Ok(false);
        }

        let count = ctx.counter().count(&count_key, findtime).await?;
        if count >= maxretry {
            ctx.cache()
                .flag(&self.ban_key(&discriminator), bantime)
                .await?;
            info!(
                rule = %self.name,
                kind = %self.kind,
                discriminator = %discriminator,
                count,
                bantime_secs = bantime.as_secs(),
                "Client banned"
            );
        }

        let blocked = self.kind == BanKind::Fail2Ban;
        if blocked {
            let data = ThrottleData {
                count,
                period: findtime,
                limit: maxretry,
            };
            self.record(req, ctx, discriminator, data);
        }
        Ok(blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Cache, ManualClock};
    use std::sync::Arc;

    fn context_at(start: u64) -> (Arc<ManualClock>, Context) {
        let clock = Arc::new(ManualClock::new(start));
        let cache = Arc::new(Cache::memory(clock.clone()));
        (clock, Context::new(cache))
    }

    fn options() -> BanOptions {
        BanOptions {
            maxretry: 3,
            findtime: Duration::from_secs(60),
            bantime: Duration::from_secs(600),
        }
    }

    fn targets_wp_login() -> Discriminator {
        Discriminator::predicate(|req| req.path().starts_with("/wp-login"))
    }

    fn get(addr: &str, path: &str) -> Request {
        Request::new("GET", path).with_remote_addr(addr)
    }

    #[tokio::test]
    async fn test_fail2ban_bans_after_maxretry() {
        let (clock, ctx) = context_at(6_000);
        let rule = Fail2Ban::rule("pentesters", options(), Discriminator::remote_addr(), targets_wp_login())
            .unwrap();

        assert!(!rule.matches(&mut get("6.6.6.6", "/"), &ctx).await.unwrap());

        for _ in 0..3 {
            assert!(rule.matches(&mut get("6.6.6.6", "/wp-login.php"), &ctx).await.unwrap());
        }
        assert!(rule.is_banned("6.6.6.6", &ctx).await.unwrap());

        let mut innocent_looking = get("6.6.6.6", "/");
        assert!(rule.matches(&mut innocent_looking, &ctx).await.unwrap());
        let data = innocent_looking.annotations().matched.clone().unwrap().data.unwrap();
        assert_eq!(data.period, Duration::from_secs(600));
        assert_eq!(data.count, 3);

        // Other clients are unaffected
        assert!(!rule.matches(&mut get("7.7.7.7", "/"), &ctx).await.unwrap());

        clock.advance(Duration::from_secs(601));
        assert!(!rule.is_banned("6.6.6.6", &ctx).await.unwrap());
        assert!(!rule.matches(&mut get("6.6.6.6", "/"), &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_banned_requests_do_not_count() {
        let (_, ctx) = context_at(6_000);
        let rule = Fail2Ban::rule("pentesters", options(), Discriminator::remote_addr(), targets_wp_login())
            .unwrap();

        for _ in 0..3 {
            rule.matches(&mut get("6.6.6.6", "/wp-login.php"), &ctx).await.unwrap();
        }
        for _ in 0..5 {
            rule.matches(&mut get("6.6.6.6", "/wp-login.php"), &ctx).await.unwrap();
        }

        let count = ctx
            .counter()
            .peek(&rule.count_key("6.6.6.6"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_allow2ban_allows_until_banned() {
        let (_, ctx) = context_at(6_000);
        let rule = Allow2Ban::rule(
            "login-scrapers",
            options(),
            Discriminator::remote_addr(),
            Discriminator::predicate(|req| req.path() == "/login"),
        )
        .unwrap();

        for _ in 0..3 {
            let mut req = get("4.4.4.4", "/login");
            assert!(!rule.matches(&mut req, &ctx).await.unwrap());
            assert!(req.annotations().matched.is_none());
        }

        let mut req = get("4.4.4.4", "/");
        assert!(rule.matches(&mut req, &ctx).await.unwrap());
        assert_eq!(
            req.annotations().matched.as_ref().unwrap().match_type,
            MatchType::Allow2Ban
        );
    }

    #[tokio::test]
    async fn test_failures_outside_findtime_do_not_accumulate() {
        let (clock, ctx) = context_at(6_000);
        let rule = Fail2Ban::rule("pentesters", options(), Discriminator::remote_addr(), targets_wp_login())
            .unwrap();

        for _ in 0..2 {
            rule.matches(&mut get("6.6.6.6", "/wp-login.php"), &ctx).await.unwrap();
        }
        clock.advance(Duration::from_secs(60));
        rule.matches(&mut get("6.6.6.6", "/wp-login.php"), &ctx).await.unwrap();

        assert!(!rule.is_banned("6.6.6.6", &ctx).await.unwrap());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut bad = options();
        bad.maxretry = 0;
        assert!(Fail2Ban::rule("r", bad, Discriminator::remote_addr(), targets_wp_login()).is_err());

        let mut bad = options();
        bad.bantime = Duration::ZERO;
        assert!(Allow2Ban::rule("r", bad, Discriminator::remote_addr(), targets_wp_login()).is_err());
    }
}
