//! Rate limit rules, presets and the registry that holds them.
//!
//! Rules are registered once at startup and looked up read-only afterwards.
//! Validation happens here so that a structurally invalid limit is rejected
//! at registration time instead of surfacing while serving requests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WardenError};

/// Longest window, backoff ceiling or penalty accepted anywhere in the engine.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 86_400);

/// Immutable configuration for one rate-limited identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    /// Key namespace this limit applies to
    pub identifier: String,
    /// Maximum requests allowed in the window
    pub requests: u64,
    /// Length of the trailing window
    pub window: Duration,
    /// Optional burst bucket layered on top of the window
    pub burst: Option<BurstConfig>,
}

impl RateLimit {
    /// Create a validated rate limit.
    pub fn new(identifier: impl Into<String>, requests: u64, window: Duration) -> Result<Self> {
        let limit = Self {
            identifier: identifier.into(),
            requests,
            window,
            burst: None,
        };
        limit.validate()?;
        Ok(limit)
    }

    /// Layer a burst bucket on top of the sliding window.
    pub fn with_burst(mut self, burst: BurstConfig) -> Result<Self> {
        burst.validate(&self.identifier)?;
        self.burst = Some(burst);
        Ok(self)
    }

    /// Check the structural invariants of this limit.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(WardenError::Config(
                "rate limit identifier must not be empty".to_string(),
            ));
        }
        if self.requests == 0 {
            return Err(WardenError::Config(format!(
                "rate limit '{}' must allow at least one request",
                self.identifier
            )));
        }
        if self.window.is_zero() {
            return Err(WardenError::Config(format!(
                "rate limit '{}' must have a positive window",
                self.identifier
            )));
        }
        if self.window > MAX_PERIOD {
            return Err(WardenError::Config(format!(
                "rate limit '{}' has a window longer than {:?}",
                self.identifier, MAX_PERIOD
            )));
        }
        if let Some(burst) = &self.burst {
            burst.validate(&self.identifier)?;
        }
        Ok(())
    }
}

/// Token bucket parameters for burst handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Maximum tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl BurstConfig {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    pub(crate) fn validate(&self, identifier: &str) -> Result<()> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(self.capacity) || self.capacity < 1.0 {
            return Err(WardenError::Config(format!(
                "burst capacity for '{}' must be at least 1.0",
                identifier
            )));
        }
        if !valid(self.refill_per_sec) {
            return Err(WardenError::Config(format!(
                "burst refill rate for '{}' must be positive",
                identifier
            )));
        }
        if Duration::try_from_secs_f64(1.0 / self.refill_per_sec).is_err() {
            return Err(WardenError::Config(format!(
                "burst refill rate for '{}' is too small",
                identifier
            )));
        }
        Ok(())
    }
}

/// Time unit for rule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Named shorthand for common limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// 10 requests per minute
    Strict,
    /// 60 requests per minute
    Moderate,
    /// 300 requests per minute
    Lenient,
    /// 1000 requests per hour
    Api,
    /// 100 requests per 10 seconds
    Burst,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Strict,
        Preset::Moderate,
        Preset::Lenient,
        Preset::Api,
        Preset::Burst,
    ];

    /// Request count and window for this preset.
    pub fn quota(&self) -> (u64, Duration) {
        match self {
            Preset::Strict => (10, Duration::from_secs(60)),
            Preset::Moderate => (60, Duration::from_secs(60)),
            Preset::Lenient => (300, Duration::from_secs(60)),
            Preset::Api => (1000, Duration::from_secs(3600)),
            Preset::Burst => (100, Duration::from_secs(10)),
        }
    }

    /// Build a rate limit for `identifier` using this preset.
    pub fn rate_limit(&self, identifier: impl Into<String>) -> Result<RateLimit> {
        let (requests, window) = self.quota();
        RateLimit::new(identifier, requests, window)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Strict => "strict",
            Preset::Moderate => "moderate",
            Preset::Lenient => "lenient",
            Preset::Api => "api",
            Preset::Burst => "burst",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| WardenError::Config(format!("unknown rate limit preset '{}'", s)))
    }
}

/// A rate limit rule as written in configuration.
///
/// A rule names a `preset`, or gives `requests` together with either a
/// `unit` or `window_secs`. Explicit values override the preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Identifier the rule applies to
    pub identifier: String,
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub requests: Option<u64>,
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub window_secs: Option<f64>,
    #[serde(default)]
    pub burst: Option<BurstConfig>,
}

impl RuleConfig {
    /// Convert this rule into a validated [`RateLimit`].
    pub fn to_rate_limit(&self) -> Result<RateLimit> {
        let preset_quota = self.preset.map(|p| p.quota());

        let requests = self
            .requests
            .or(preset_quota.map(|(r, _)| r))
            .ok_or_else(|| {
                WardenError::Config(format!(
                    "rule '{}' needs either a preset or a request count",
                    self.identifier
                ))
            })?;

        let window = match (self.window_secs, self.unit) {
            (Some(secs), _) => {
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(WardenError::Config(format!(
                        "rule '{}' has a non-positive window",
                        self.identifier
                    )));
                }
                Duration::try_from_secs_f64(secs).map_err(|_| {
                    WardenError::Config(format!(
                        "rule '{}' has a window of {} seconds, which is too long",
                        self.identifier, secs
                    ))
                })?
            }
            (None, Some(unit)) => unit.duration(),
            (None, None) => preset_quota.map(|(_, w)| w).ok_or_else(|| {
                WardenError::Config(format!(
                    "rule '{}' needs a unit, window_secs or preset",
                    self.identifier
                ))
            })?,
        };

        let limit = RateLimit::new(self.identifier.clone(), requests, window)?;
        match self.burst {
            Some(burst) => limit.with_burst(burst),
            None => Ok(limit),
        }
    }
}

/// Registry of configured limits, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct RateLimitRegistry {
    limits: HashMap<String, Arc<RateLimit>>,
}

impl RateLimitRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration rules, failing on the first invalid rule.
    pub fn from_rules(rules: &[RuleConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for rule in rules {
            registry.register(rule.to_rate_limit()?)?;
        }
        info!(count = registry.len(), "Loaded rate limit rules");
        Ok(registry)
    }

    /// Register a limit, replacing any previous limit for the same identifier.
    pub fn register(&mut self, limit: RateLimit) -> Result<()> {
        limit.validate()?;
        self.limits
            .insert(limit.identifier.clone(), Arc::new(limit));
        Ok(())
    }

    /// Look up the limit for an identifier.
    pub fn get(&self, identifier: &str) -> Option<Arc<RateLimit>> {
        self.limits.get(identifier).cloned()
    }

    pub fn remove(&mut self, identifier: &str) -> Option<Arc<RateLimit>> {
        self.limits.remove(identifier)
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateLimit> {
        self.limits.values().map(|l| l.as_ref())
    }
}
