//! User-supplied request functions: discriminators, limits and periods.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BoxError, GatekeeperError, Result};
use crate::request::Request;

type DiscriminatorFn =
    dyn Fn(&Request) -> std::result::Result<Option<String>, BoxError> + Send + Sync;

/// Derives the partitioning value for a request, or `None` when the rule
/// does not apply to it.
#[derive(Clone)]
pub struct Discriminator(Arc<DiscriminatorFn>);

impl Discriminator {
    /// Wrap an infallible extractor.
    ///
    /// `Some(false)` counts as no match, the same as `None`.
    pub fn new<F, V>(f: F) -> Self
    where
        F: Fn(&Request) -> Option<V> + Send + Sync + 'static,
        V: ToString + 'static,
    {
        Self(Arc::new(move |req| Ok(f(req).and_then(matched_value))))
    }

    /// Wrap an extractor that can fail. Failures surface as
    /// [`GatekeeperError::Discriminator`] from the evaluating call.
    pub fn try_new<F, V>(f: F) -> Self
    where
        F: Fn(&Request) -> std::result::Result<Option<V>, BoxError> + Send + Sync + 'static,
        V: ToString + 'static,
    {
        Self(Arc::new(move |req| Ok(f(req)?.and_then(matched_value))))
    }

    /// Wrap a yes/no predicate; a match yields the value `"true"`.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        Self::new(move |req| f(req).then_some("true"))
    }

    /// Partition by client address.
    pub fn remote_addr() -> Self {
        Self::new(|req| req.remote_addr().map(str::to_string))
    }

    pub(crate) fn resolve(&self, rule: &str, req: &Request) -> Result<Option<String>> {
        (self.0)(req).map_err(|source| GatekeeperError::Discriminator {
            rule: rule.to_string(),
            source,
        })
    }
}

fn matched_value<V: ToString + 'static>(value: V) -> Option<String> {
    match (&value as &dyn Any).downcast_ref::<bool>() {
        Some(false) => None,
        _ => Some(value.to_string()),
    }
}

impl fmt::Debug for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Discriminator(..)")
    }
}

/// A value fixed at registration or computed from each request.
pub enum Resolvable<T> {
    Fixed(T),
    Dynamic(Arc<dyn Fn(&Request) -> T + Send + Sync>),
}

impl<T: Copy> Resolvable<T> {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&Request) -> T + Send + Sync + 'static,
    {
        Resolvable::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, req: &Request) -> T {
        match self {
            Resolvable::Fixed(value) => *value,
            Resolvable::Dynamic(f) => f(req),
        }
    }

    pub(crate) fn fixed(&self) -> Option<T> {
        match self {
            Resolvable::Fixed(value) => Some(*value),
            Resolvable::Dynamic(_) => None,
        }
    }
}

impl<T: Clone> Clone for Resolvable<T> {
    fn clone(&self) -> Self {
        match self {
            Resolvable::Fixed(value) => Resolvable::Fixed(value.clone()),
            Resolvable::Dynamic(f) => Resolvable::Dynamic(f.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolvable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolvable::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Resolvable::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Maximum events per window.
pub type Limit = Resolvable<u64>;
/// Window length.
pub type Period = Resolvable<Duration>;

impl From<u64> for Limit {
    fn from(value: u64) -> Self {
        Resolvable::Fixed(value)
    }
}

impl From<Duration> for Period {
    fn from(value: Duration) -> Self {
        Resolvable::Fixed(value)
    }
}

/// Reject periods that cannot form a window. Windows are bucketed in whole
/// seconds, so fractional periods are refused rather than truncated.
pub(crate) fn check_period(rule: &str, period: Duration) -> Result<Duration> {
    if period.as_secs() == 0 {
        return Err(GatekeeperError::config(format!(
            "rule '{}': period must be at least one second, got {:?}",
            rule, period
        )));
    }
    if period.subsec_nanos() != 0 {
        return Err(GatekeeperError::config(format!(
            "rule '{}': period must be a whole number of seconds, got {:?}",
            rule, period
        )));
    }
    Ok(period)
}

/// Resolve a period for `req`, rejecting dynamic values that fail [`check_period`].
pub(crate) fn resolve_period(rule: &str, period: &Period, req: &Request) -> Result<Duration> {
    check_period(rule, period.resolve(req))
}
