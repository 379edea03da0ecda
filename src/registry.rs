//! Named rule registry.
//!
//! Rules are grouped by matcher type; a name is unique within its group.
//! The registry is copy-on-write: registration builds a new [`RuleSet`] and
//! swaps it in, while evaluations work on an `Arc` snapshot taken up front.
//! Registering during live traffic is therefore safe, and an in-flight
//! request never sees a half-applied change.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{GatekeeperError, Result};
use crate::matchers::{
    BanKind, BanOptions, BanRule, Check, Discriminator, FailedThrottle, FailedThrottleOptions,
    Matcher, Throttle, ThrottleOptions, Track, TrackOptions,
};

/// What to do when a rule is registered under a name already in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// The later registration replaces the earlier one
    #[default]
    Overwrite,
    /// The later registration fails with a configuration error
    Error,
}

/// An immutable snapshot of every registered rule.
#[derive(Clone, Default)]
pub struct RuleSet {
    pub(crate) allowlist: HashMap<String, Arc<dyn Matcher>>,
    pub(crate) blocklist: HashMap<String, Arc<dyn Matcher>>,
    pub(crate) throttles: HashMap<String, Throttle>,
    pub(crate) failed_throttles: HashMap<String, FailedThrottle>,
    pub(crate) tracks: HashMap<String, Track>,
}

impl RuleSet {
    pub fn allowlist_len(&self) -> usize {
        self.allowlist.len()
    }

    pub fn blocklist_len(&self) -> usize {
        self.blocklist.len()
    }

    pub fn throttles_len(&self) -> usize {
        self.throttles.len()
    }

    pub fn failed_throttles_len(&self) -> usize {
        self.failed_throttles.len()
    }

    pub fn tracks_len(&self) -> usize {
        self.tracks.len()
    }

    pub fn len(&self) -> usize {
        self.allowlist.len()
            + self.blocklist.len()
            + self.throttles.len()
            + self.failed_throttles.len()
            + self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSet")
            .field("allowlist", &self.allowlist.keys().collect::<Vec<_>>())
            .field("blocklist", &self.blocklist.keys().collect::<Vec<_>>())
            .field("throttles", &self.throttles.keys().collect::<Vec<_>>())
            .field("failed_throttles", &self.failed_throttles.keys().collect::<Vec<_>>())
            .field("tracks", &self.tracks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Holds named rules of every matcher type.
#[derive(Debug, Default)]
pub struct Registry {
    rules: RwLock<Arc<RuleSet>>,
    policy: DuplicatePolicy,
}

impl Registry {
    /// Create an empty registry where re-registration overwrites.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::default())),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// The current rules. Later registrations do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Register an allow rule.
    pub fn allow(&self, name: &str, discriminator: Discriminator) -> Result<()> {
        self.allow_matcher(Check::allow(name, discriminator))
    }

    /// Register any matcher as an allow rule.
    pub fn allow_matcher<M: Matcher + 'static>(&self, matcher: M) -> Result<()> {
        let name = matcher.name().to_string();
        let matcher: Arc<dyn Matcher> = Arc::new(matcher);
        self.update(|rules| insert(&mut rules.allowlist, name, matcher, "allow", self.policy))
    }

    /// Register a deny rule.
    pub fn deny(&self, name: &str, discriminator: Discriminator) -> Result<()> {
        self.deny_matcher(Check::deny(name, discriminator))
    }

    /// Register any matcher as a deny rule.
    pub fn deny_matcher<M: Matcher + 'static>(&self, matcher: M) -> Result<()> {
        let name = matcher.name().to_string();
        let matcher: Arc<dyn Matcher> = Arc::new(matcher);
        self.update(|rules| insert(&mut rules.blocklist, name, matcher, "deny", self.policy))
    }

    /// Register a fail2ban rule as a deny rule.
    pub fn fail2ban(
        &self,
        name: &str,
        options: BanOptions,
        discriminator: Discriminator,
        filter: Discriminator,
    ) -> Result<()> {
        self.deny_matcher(BanRule::new(name, BanKind::Fail2Ban, options, discriminator, filter)?)
    }

    /// Register an allow2ban rule as a deny rule.
    pub fn allow2ban(
        &self,
        name: &str,
        options: BanOptions,
        discriminator: Discriminator,
        filter: Discriminator,
    ) -> Result<()> {
        self.deny_matcher(BanRule::new(name, BanKind::Allow2Ban, options, discriminator, filter)?)
    }

    /// Register a rate limiter. Fails if `limit` or `period` is missing.
    pub fn throttle(&self, name: &str, options: ThrottleOptions, discriminator: Discriminator) -> Result<()> {
        let throttle = Throttle::new(name, options, discriminator)?;
        self.update(|rules| insert(&mut rules.throttles, name.to_string(), throttle, "throttle", self.policy))
    }

    /// Register a failed-attempt limiter. Fails if `limit` or `period` is missing.
    pub fn failed_throttle(
        &self,
        name: &str,
        options: FailedThrottleOptions,
        discriminator: Discriminator,
    ) -> Result<()> {
        let rule = FailedThrottle::new(name, options, discriminator)?;
        self.update(|rules| {
            insert(&mut rules.failed_throttles, name.to_string(), rule, "failed_throttle", self.policy)
        })
    }

    /// Register an observer.
    pub fn track(&self, name: &str, options: TrackOptions, discriminator: Discriminator) -> Result<()> {
        let track = Track::new(name, options, discriminator)?;
        self.update(|rules| insert(&mut rules.tracks, name.to_string(), track, "track", self.policy))
    }

    /// Drop every registered rule.
    pub fn clear(&self) {
        *self.rules.write() = Arc::new(RuleSet::default());
        info!("Cleared all rules");
    }

    /// Run several registrations against a staging copy and swap the result
    /// in only if `build` succeeds. On error the registry is left untouched.
    ///
    /// `build` must register through the registry it is handed, not `self`.
    pub fn transaction<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(&Registry) -> Result<T>,
    {
        let mut current = self.rules.write();
        let staging = Registry {
            rules: RwLock::new(current.clone()),
            policy: self.policy,
        };
        let value = build(&staging)?;
        *current = staging.snapshot();
        Ok(value)
    }

    fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut RuleSet) -> Result<()>,
    {
        let mut current = self.rules.write();
        let mut next = RuleSet::clone(&current);
        apply(&mut next)?;
        *current = Arc::new(next);
        Ok(())
    }
}

fn insert<T>(
    map: &mut HashMap<String, T>,
    name: String,
    rule: T,
    kind: &str,
    policy: DuplicatePolicy,
) -> Result<()> {
    if policy == DuplicatePolicy::Error && map.contains_key(&name) {
        return Err(GatekeeperError::config(format!(
            "{} rule '{}' is already registered",
            kind, name
        )));
    }

    let replaced = map.insert(name.clone(), rule).is_some();
    debug!(kind, rule = %name, replaced, "Registered rule");
    Ok(())
}
