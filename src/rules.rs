//! Declarative rule files.
//!
//! A rule file lists rules per matcher type. Each entry derives its
//! discriminator from a built-in key extractor, optionally narrowed by path,
//! method and value filters:
//!
//! ```yaml
//! allow:
//!   - name: office
//!     key: remote_address
//!     values: ["10.0.0.1", "10.0.0.2"]
//! throttle:
//!   - name: req/ip
//!     limit: 300
//!     period: minute
//! failed_throttle:
//!   - name: logins/ip
//!     path_prefix: /login
//!     method: POST
//!     limit: 5
//!     period: 300
//! fail2ban:
//!   - name: pentesters
//!     path_prefix: /wp-admin
//!     maxretry: 3
//!     findtime: 600
//!     bantime: hour
//! ```
//!
//! Periods are either whole seconds or one of `second`, `minute`, `hour`, `day`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::matchers::{BanOptions, Discriminator, FailedThrottleOptions, ThrottleOptions, TrackOptions};
use crate::registry::Registry;
use crate::request::Request;
use crate::store::TimeWindow;

/// Where an entry takes its discriminator value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    #[default]
    RemoteAddress,
    Path,
    Method,
    /// The header named by the entry's `header` field
    Header,
}

/// A period given as seconds or as a named window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodSpec {
    Seconds(u64),
    Window(TimeWindow),
}

impl From<PeriodSpec> for Duration {
    fn from(spec: PeriodSpec) -> Self {
        match spec {
            PeriodSpec::Seconds(secs) => Duration::from_secs(secs),
            PeriodSpec::Window(window) => window.duration(),
        }
    }
}

/// One rule in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    pub name: String,
    #[serde(default)]
    pub key: KeySource,
    /// Header name, required when `key` is `header`
    #[serde(default)]
    pub header: Option<String>,
    /// Only requests whose path starts with this prefix apply
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Only requests with this method apply (case-insensitive)
    #[serde(default)]
    pub method: Option<String>,
    /// Only these key values apply; empty means any value
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub period: Option<PeriodSpec>,
    /// Half-open `[low, high)` range of successful statuses
    #[serde(default)]
    pub ok_codes: Option<[u16; 2]>,
    /// Custom label for failed-attempt matches
    #[serde(default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub maxretry: Option<u64>,
    #[serde(default)]
    pub findtime: Option<PeriodSpec>,
    #[serde(default)]
    pub bantime: Option<PeriodSpec>,
}

/// A complete rule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleFile {
    pub allow: Vec<RuleEntry>,
    pub deny: Vec<RuleEntry>,
    pub throttle: Vec<RuleEntry>,
    pub failed_throttle: Vec<RuleEntry>,
    pub track: Vec<RuleEntry>,
    pub fail2ban: Vec<RuleEntry>,
    pub allow2ban: Vec<RuleEntry>,
}

impl RuleFile {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::config(format!("Failed to parse rule file: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.allow.len()
            + self.deny.len()
            + self.throttle.len()
            + self.failed_throttle.len()
            + self.track.len()
            + self.fail2ban.len()
            + self.allow2ban.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every rule with `registry`, returning how many were registered.
    ///
    /// All or nothing: an invalid entry leaves `registry` as it was.
    pub fn apply(&self, registry: &Registry) -> Result<usize> {
        registry.transaction(|staging| self.register(staging))?;

        let total = self.len();
        info!(rules = total, "Rules registered");
        Ok(total)
    }

    fn register(&self, registry: &Registry) -> Result<()> {
        for entry in &self.allow {
            registry.allow(&entry.name, entry.discriminator()?)?;
        }
        for entry in &self.deny {
            registry.deny(&entry.name, entry.discriminator()?)?;
        }
        for entry in &self.throttle {
            registry.throttle(&entry.name, entry.throttle_options(), entry.discriminator()?)?;
        }
        for entry in &self.failed_throttle {
            let mut options = FailedThrottleOptions {
                throttle: entry.throttle_options(),
                ..FailedThrottleOptions::new()
            };
            if let Some([low, high]) = entry.ok_codes {
                options = options.ok_codes(low..high);
            }
            if let Some(label) = &entry.match_type {
                options = options.match_type(label.clone());
            }
            registry.failed_throttle(&entry.name, options, entry.discriminator()?)?;
        }
        for entry in &self.track {
            let options: TrackOptions = entry.throttle_options();
            registry.track(&entry.name, options, entry.discriminator()?)?;
        }
        for entry in &self.fail2ban {
            registry.fail2ban(&entry.name, entry.ban_options()?, entry.key_only()?, entry.discriminator()?)?;
        }
        for entry in &self.allow2ban {
            registry.allow2ban(&entry.name, entry.ban_options()?, entry.key_only()?, entry.discriminator()?)?;
        }
        Ok(())
    }
}

impl RuleEntry {
    fn throttle_options(&self) -> ThrottleOptions {
        let mut options = ThrottleOptions::new();
        if let Some(limit) = self.limit {
            options = options.limit(limit);
        }
        if let Some(period) = self.period {
            options = options.period(Duration::from(period));
        }
        options
    }

    fn ban_options(&self) -> Result<BanOptions> {
        let required = |field: &str| {
            GatekeeperError::config(format!("rule '{}': {} is required", self.name, field))
        };
        Ok(BanOptions {
            maxretry: self.maxretry.ok_or_else(|| required("maxretry"))?,
            findtime: self.findtime.ok_or_else(|| required("findtime"))?.into(),
            bantime: self.bantime.ok_or_else(|| required("bantime"))?.into(),
        })
    }

    fn extractor(&self) -> Result<KeyExtractor> {
        match (self.key, &self.header) {
            (KeySource::Header, Some(name)) => Ok(KeyExtractor::Header(name.to_lowercase())),
            (KeySource::Header, None) => Err(GatekeeperError::config(format!(
                "rule '{}': key 'header' needs a header name",
                self.name
            ))),
            (source, _) => Ok(KeyExtractor::Field(source)),
        }
    }

    /// The bare key, ignoring every filter. Identifies the client for ban rules.
    fn key_only(&self) -> Result<Discriminator> {
        let extractor = self.extractor()?;
        Ok(Discriminator::new(move |req| extractor.extract(req)))
    }

    /// The key narrowed by this entry's filters.
    fn discriminator(&self) -> Result<Discriminator> {
        let extractor = self.extractor()?;
        let path_prefix = self.path_prefix.clone();
        let method = self.method.clone();
        let values = self.values.clone();

        Ok(Discriminator::new(move |req| {
            if let Some(prefix) = &path_prefix {
                if !req.path().starts_with(prefix.as_str()) {
                    return None;
                }
            }
            if let Some(method) = &method {
                if !req.method().eq_ignore_ascii_case(method) {
                    return None;
                }
            }
            let value = extractor.extract(req)?;
            if !values.is_empty() && !values.contains(&value) {
                return None;
            }
            Some(value)
        }))
    }
}

#[derive(Debug, Clone)]
enum KeyExtractor {
    Field(KeySource),
    Header(String),
}

impl KeyExtractor {
    fn extract(&self, req: &Request) -> Option<String> {
        match self {
            KeyExtractor::Field(KeySource::RemoteAddress) => req.remote_addr().map(str::to_string),
            KeyExtractor::Field(KeySource::Path) => Some(req.path().to_string()),
            KeyExtractor::Field(KeySource::Method) => Some(req.method().to_string()),
            KeyExtractor::Field(KeySource::Header) => None,
            KeyExtractor::Header(name) => req.header(name).map(str::to_string),
        }
    }
}
