//! Matcher types and the context they evaluate against.
//!
//! Every matcher wraps a name, a user-supplied [`Discriminator`] and its own
//! options. Evaluation never mutates the matcher; the only side effects are
//! counter increments, request annotations and match notifications.

mod ban;
mod check;
mod discriminator;
mod failed_throttle;
mod throttle;
mod track;

pub use ban::{Allow2Ban, BanKind, BanOptions, BanRule, Fail2Ban};
pub use check::Check;
pub use discriminator::{Discriminator, Limit, Period, Resolvable};
pub use failed_throttle::{FailedThrottle, FailedThrottleOptions, DEFAULT_OK_CODES};
pub use throttle::{Throttle, ThrottleOptions};
pub use track::{Track, TrackOptions};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::notify::{MatchEvent, Notifier};
use crate::request::{MatchRecord, MatchType, Request};
use crate::store::{Cache, WindowCounter};

/// Common evaluation capability of all matcher types.
#[async_trait]
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    fn match_type(&self) -> MatchType;

    /// Decide whether this rule matches `req`, recording any side effects.
    async fn matches(&self, req: &mut Request, ctx: &Context) -> Result<bool>;
}

/// Shared services handed to matchers during evaluation.
#[derive(Clone)]
pub struct Context {
    counter: WindowCounter,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Context {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            counter: WindowCounter::new(cache),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn counter(&self) -> &WindowCounter {
        &self.counter
    }

    pub fn cache(&self) -> &Cache {
        self.counter.cache()
    }

    /// Annotate `req` with `record` and hand it to the notifier, if any.
    pub(crate) fn record_match(&self, req: &mut Request, record: MatchRecord) {
        debug!(
            rule = %record.rule,
            match_type = %record.match_type,
            discriminator = %record.discriminator,
            "Rule matched"
        );

        if let Some(notifier) = &self.notifier {
            notifier.instrument(&MatchEvent::new(record.clone(), req));
        }
        req.annotations_mut().matched = Some(record);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("counter", &self.counter)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}
