//! Request descriptor and the per-request match annotations.
//!
//! The web-framework integration builds a [`Request`] from whatever it
//! receives on the wire. The engine only reads it, except for the
//! [`Annotations`] side-channel that records which rule fired.

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// A read-mostly view of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    remote_addr: Option<String>,
    method: String,
    path: String,
    /// Header names are stored lowercased
    headers: HashMap<String, String>,
    annotations: Annotations,
}

impl Request {
    /// Create a request descriptor for the given method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the client address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Add a header. Names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Match metadata attached while evaluating this request.
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub(crate) fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }
}

/// Side-channel populated by matchers when they fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Annotations {
    /// The last rule that matched this request
    pub matched: Option<MatchRecord>,
    /// Data for every failed-attempt limiter that fired, keyed by rule name
    pub failed_throttle_data: BTreeMap<String, ThrottleData>,
}

/// Which rule matched, for whom, and with what counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRecord {
    pub rule: String,
    pub discriminator: String,
    pub match_type: MatchType,
    pub data: Option<ThrottleData>,
}

/// Kind of matcher that produced a [`MatchRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchType {
    Allowlist,
    Blocklist,
    Throttle,
    FailedThrottle,
    Track,
    Fail2Ban,
    Allow2Ban,
    /// Caller-chosen label, e.g. a failed-attempt limiter registered with a custom type
    Custom(String),
}

impl MatchType {
    pub fn as_str(&self) -> &str {
        match self {
            MatchType::Allowlist => "allowlist",
            MatchType::Blocklist => "blocklist",
            MatchType::Throttle => "throttle",
            MatchType::FailedThrottle => "failed_throttle",
            MatchType::Track => "track",
            MatchType::Fail2Ban => "fail2ban",
            MatchType::Allow2Ban => "allow2ban",
            MatchType::Custom(label) => label,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MatchType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Counter state reported by a counting matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleData {
    pub count: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub period: Duration,
    pub limit: u64,
}

impl ThrottleData {
    /// Seconds a client should wait before retrying.
    pub fn retry_after(&self) -> u64 {
        self.period.as_secs()
    }
}

fn serialize_secs<S: Serializer>(period: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(period.as_secs())
}
