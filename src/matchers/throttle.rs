//! Rate limiter: counts every matching request in a fixed window.

use async_trait::async_trait;
use tracing::{debug, trace};

use super::discriminator::{check_period, resolve_period};
use super::{Context, Discriminator, Limit, Matcher, Period};
use crate::error::{GatekeeperError, Result};
use crate::request::{MatchRecord, MatchType, Request, ThrottleData};
use crate::store::WindowKey;

/// Options for a rate limiter. `limit` and `period` are mandatory.
#[derive(Debug, Clone, Default)]
pub struct ThrottleOptions {
    pub limit: Option<Limit>,
    pub period: Option<Period>,
}

impl ThrottleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: impl Into<Limit>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn period(mut self, period: impl Into<Period>) -> Self {
        self.period = Some(period.into());
        self
    }

    /// Check mandatory options, returning `(limit, period)`.
    pub(crate) fn validate(self, rule: &str) -> Result<(Limit, Period)> {
        let limit = self
            .limit
            .ok_or_else(|| GatekeeperError::config(format!("rule '{}': must pass limit option", rule)))?;
        let period = self
            .period
            .ok_or_else(|| GatekeeperError::config(format!("rule '{}': must pass period option", rule)))?;

        if let Some(fixed) = period.fixed() {
            check_period(rule, fixed)?;
        }
        Ok((limit, period))
    }
}

/// Throttles a discriminator once it exceeds `limit` events per `period`.
///
/// Every matching request consumes a slot, including the ones that end up
/// throttled. The request that brings the count to `limit + 1` is the first
/// one throttled.
#[derive(Debug, Clone)]
pub struct Throttle {
    name: String,
    discriminator: Discriminator,
    limit: Limit,
    period: Period,
}

impl Throttle {
    pub fn new(
        name: impl Into<String>,
        options: ThrottleOptions,
        discriminator: Discriminator,
    ) -> Result<Self> {
        let name = name.into();
        let (limit, period) = options.validate(&name)?;
        Ok(Self {
            name,
            discriminator,
            limit,
            period,
        })
    }
}

#[async_trait]
impl Matcher for Throttle {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_type(&self) -> MatchType {
        MatchType::Throttle
    }

    async fn matches(&self, req: &mut Request, ctx: &Context) -> Result<bool> {
        let Some(discriminator) = self.discriminator.resolve(&self.name, req)? else {
            return Ok(false);
        };

        let period = resolve_period(&self.name, &self.period, req)?;
        let limit = self.limit.resolve(req);
        let key = WindowKey::new(&self.name, &discriminator);

        let count = ctx.counter().count(&key, period).await?;
        let throttled = count > limit;

        trace!(key = %key, count, limit, throttled, "Evaluated throttle");

        if throttled {
            debug!(key = %key, count, limit, "Throttle limit exceeded");
            ctx.record_match(
                req,
                MatchRecord {
                    rule: self.name.clone(),
                    discriminator,
                    match_type: MatchType::Throttle,
                    data: Some(ThrottleData { count, period, limit }),
                },
            );
        }
        Ok(throttled)
    }
}
