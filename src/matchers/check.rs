//! Allow and deny rules: plain yes/no matches.

use async_trait::async_trait;
use tracing::trace;

use super::{Context, Discriminator, Matcher};
use crate::error::Result;
use crate::request::{MatchRecord, MatchType, Request};

/// A rule that matches whenever its discriminator yields a value.
#[derive(Debug, Clone)]
pub struct Check {
    name: String,
    discriminator: Discriminator,
    match_type: MatchType,
}

impl Check {
    /// Requests matching an allow rule bypass every other check.
    pub fn allow(name: impl Into<String>, discriminator: Discriminator) -> Self {
        Self {
            name: name.into(),
            discriminator,
            match_type: MatchType::Allowlist,
        }
    }

    /// Requests matching a deny rule are rejected.
    pub fn deny(name: impl Into<String>, discriminator: Discriminator) -> Self {
        Self {
            name: name.into(),
            discriminator,
            match_type: MatchType::Blocklist,
        }
    }
}

#[async_trait]
impl Matcher for Check {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_type(&self) -> MatchType {
        self.match_type.clone()
    }

    async fn matches(&self, req: &mut Request, ctx: &Context) -> Result<bool> {
        let Some(value) = self.discriminator.resolve(&self.name, req)? else {
            trace!(rule = %self.name, "Check did not apply");
            return Ok(false);
        };

        ctx.record_match(
            req,
            MatchRecord {
                rule: self.name.clone(),
                discriminator: value,
                match_type: self.match_type.clone(),
                data: None,
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Cache, ManualClock};
    use std::sync::Arc;

    fn context() -> Context {
        Context::new(Arc::new(Cache::memory(Arc::new(ManualClock::new(0)))))
    }

    #[tokio::test]
    async fn test_deny_rule_annotates_match() {
        let ctx = context();
        let rule = Check::deny(
            "bad-agents",
            Discriminator::new(|req| {
                req.header("user-agent")
                    .filter(|ua| ua.contains("sqlmap"))
                    .map(str::to_string)
            }),
        );

        let mut req = Request::new("GET", "/").with_header("User-Agent", "sqlmap/1.7");
        assert!(rule.matches(&mut req, &ctx).await.unwrap());

        let matched = req.annotations().matched.clone().unwrap();
        assert_eq!(matched.rule, "bad-agents");
        assert_eq!(matched.match_type, MatchType::Blocklist);
        assert_eq!(matched.discriminator, "sqlmap/1.7");
        assert!(matched.data.is_none());
    }

    #[tokio::test]
    async fn test_absent_discriminator_does_not_match() {
        let ctx = context();
        let rule = Check::allow(
            "office",
            Discriminator::predicate(|req| req.remote_addr() == Some("10.0.0.1")),
        );

        let mut req = Request::new("GET", "/").with_remote_addr("8.8.8.8");
        assert!(!rule.matches(&mut req, &ctx).await.unwrap());
        assert!(req.annotations().matched.is_none());
        assert_eq!(rule.match_type(), MatchType::Allowlist);
    }
}
