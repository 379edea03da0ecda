//! Rule dispatcher: combines every registered rule into one verdict.
//!
//! Precedence is fixed. Each step short-circuits on the first match:
//!
//! 1. allow rules → [`Verdict::Allowed`] (skips every other check)
//! 2. deny rules → [`Verdict::Denied`]
//! 3. rate limiters → [`Verdict::Throttled`]
//! 4. failed-attempt limiters → [`Verdict::Throttled`]
//! 5. observers run for telemetry → [`Verdict::PassThrough`]
//!
//! Order among rules of the same type is unspecified.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::matchers::{Context, Matcher};
use crate::notify::Notifier;
use crate::registry::{Registry, RuleSet};
use crate::request::Request;
use crate::store::Cache;

/// The engine's decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// An allow rule matched; the handler runs without further checks
    Allowed,
    /// A deny rule matched
    Denied,
    /// A rate limiter or failed-attempt limiter fired
    Throttled,
    /// Nothing blocked the request; the handler runs and its response is tracked
    PassThrough,
}

impl Verdict {
    /// Whether the handler must not run.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Verdict::Denied | Verdict::Throttled)
    }
}

/// Response types that expose an HTTP status for failure tracking.
pub trait ResponseStatus {
    fn status(&self) -> u16;
}

impl ResponseStatus for u16 {
    fn status(&self) -> u16 {
        *self
    }
}

/// Result of running a request through [`Gatekeeper::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<R> {
    /// The request was rejected; the handler never ran
    Blocked(Verdict),
    /// The handler ran and produced a response
    Handled(Verdict, R),
}

impl<R> Outcome<R> {
    pub fn verdict(&self) -> Verdict {
        match self {
            Outcome::Blocked(verdict) | Outcome::Handled(verdict, _) => *verdict,
        }
    }
}

/// The admission engine.
pub struct Gatekeeper {
    registry: Arc<Registry>,
    ctx: Context,
}

impl Gatekeeper {
    pub fn new(registry: Arc<Registry>, cache: Arc<Cache>) -> Self {
        Self {
            registry,
            ctx: Context::new(cache),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.ctx = self.ctx.with_notifier(notifier);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Decide what to do with `req` without running a handler.
    pub async fn evaluate(&self, req: &mut Request) -> Result<Verdict> {
        let rules = self.registry.snapshot();
        self.evaluate_rules(&rules, req).await
    }

    /// Count the handler's response against every failed-attempt limiter.
    pub async fn track_response(&self, req: &Request, status: u16) -> Result<()> {
        let rules = self.registry.snapshot();
        self.track_failures(&rules, req, status).await
    }

    /// Run `req` through the full pipeline.
    ///
    /// The handler runs for [`Verdict::Allowed`] and [`Verdict::PassThrough`].
    /// Only pass-through responses are tracked by failed-attempt limiters.
    pub async fn call<H, Fut, R>(&self, req: &mut Request, handler: H) -> Result<Outcome<R>>
    where
        H: FnOnce(&Request) -> Fut,
        Fut: Future<Output = R>,
        R: ResponseStatus,
    {
        let rules = self.registry.snapshot();
        let verdict = self.evaluate_rules(&rules, req).await?;

        match verdict {
            Verdict::Denied | Verdict::Throttled => Ok(Outcome::Blocked(verdict)),
            Verdict::Allowed => Ok(Outcome::Handled(verdict, handler(&*req).await)),
            Verdict::PassThrough => {
                let response = handler(&*req).await;
                self.track_failures(&rules, req, response.status()).await?;
                Ok(Outcome::Handled(verdict, response))
            }
        }
    }

    async fn evaluate_rules(&self, rules: &RuleSet, req: &mut Request) -> Result<Verdict> {
        trace!(method = %req.method(), path = %req.path(), "Evaluating request");

        if any_match(rules.allowlist.values().map(Arc::as_ref), req, &self.ctx).await? {
            return Ok(self.decided(Verdict::Allowed, req));
        }
        if any_match(rules.blocklist.values().map(Arc::as_ref), req, &self.ctx).await? {
            return Ok(self.decided(Verdict::Denied, req));
        }
        if any_match(rules.throttles.values(), req, &self.ctx).await? {
            return Ok(self.decided(Verdict::Throttled, req));
        }
        if any_match(rules.failed_throttles.values(), req, &self.ctx).await? {
            return Ok(self.decided(Verdict::Throttled, req));
        }

        for track in rules.tracks.values() {
            track.matches(req, &self.ctx).await?;
        }
        Ok(Verdict::PassThrough)
    }

    async fn track_failures(&self, rules: &RuleSet, req: &Request, status: u16) -> Result<()> {
        for rule in rules.failed_throttles.values() {
            rule.track(req, status, &self.ctx).await?;
        }
        Ok(())
    }

    fn decided(&self, verdict: Verdict, req: &Request) -> Verdict {
        debug!(
            verdict = ?verdict,
            rule = req.annotations().matched.as_ref().map(|m| m.rule.as_str()),
            remote_addr = req.remote_addr(),
            path = %req.path(),
            "Request decided"
        );
        verdict
    }
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("registry", &self.registry)
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// True if any matcher matches, stopping at the first one that does.
async fn any_match<'a, M, I>(matchers: I, req: &mut Request, ctx: &Context) -> Result<bool>
where
    M: Matcher + ?Sized + 'a,
    I: Iterator<Item = &'a M>,
{
    for matcher in matchers {
        if matcher.matches(req, ctx).await? {
            return Ok(true);
        }
    }
    Ok(false)
}
