//! Observers: report matches without ever blocking.

use async_trait::async_trait;
use tracing::trace;

use super::discriminator::resolve_period;
use super::throttle::ThrottleOptions;
use super::{Context, Discriminator, Limit, Matcher, Period};
use crate::error::{GatekeeperError, Result};
use crate::request::{MatchRecord, MatchType, Request, ThrottleData};
use crate::store::WindowKey;

/// Options for an observer. Either both `limit` and `period` are set, making
/// the observer report only once a discriminator exceeds the limit, or
/// neither is set and every match is reported.
pub type TrackOptions = ThrottleOptions;

#[derive(Debug, Clone)]
pub struct Track {
    name: String,
    discriminator: Discriminator,
    threshold: Option<(Limit, Period)>,
}

impl Track {
    pub fn new(
        name: impl Into<String>,
        options: TrackOptions,
        discriminator: Discriminator,
    ) -> Result<Self> {
        let name = name.into();
        let configured = (options.limit.is_some(), options.period.is_some());
        let threshold = match configured {
            (false, false) => None,
            (true, true) => Some(options.validate(&name)?),
            _ => {
                return Err(GatekeeperError::config(format!(
                    "rule '{}': limit and period must be passed together",
                    name
                )))
            }
        };

        Ok(Self {
            name,
            discriminator,
            threshold,
        })
    }
}

#[async_trait]
impl Matcher for Track {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_type(&self) -> MatchType {
        MatchType::Track
    }

    async fn matches(&self, req: &mut Request, ctx: &Context) -> Result<bool> {
        let Some(discriminator) = self.discriminator.resolve(&self.name, req)? else {
            return Ok(false);
        };

        let data = match &self.threshold {
            None => None,
            Some((limit, period)) => {
                let period = resolve_period(&self.name, period, req)?;
                let limit = limit.resolve(req);
                let key = WindowKey::new(&self.name, &discriminator);
                let count = ctx.counter().count(&key, period).await?;

                trace!(key = %key, count, limit, "Evaluated tracker");
                if count <= limit {
                    return Ok(false);
                }
                Some(ThrottleData { count, period, limit })
            }
        };

        ctx.record_match(
            req,
            MatchRecord {
                rule: self.name.clone(),
                discriminator,
                match_type: MatchType::Track,
                data,
            },
        );
        Ok(true)
    }
}
