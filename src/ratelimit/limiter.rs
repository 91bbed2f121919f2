//! Core rate limiter implementation.
//!
//! The engine combines the sliding window log, the violation tracker and the
//! burst buckets behind a single lock so that a check and the bookkeeping it
//! implies happen atomically for every key.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::burst::{BurstBucketController, BurstDecision};
use super::detector::{DetectorConfig, SuspiciousActivityDetector};
use super::key::LimitKey;
use super::result::{CleanupReport, RateLimitResult, Statistics};
use super::rules::{BurstConfig, RateLimit, RateLimitRegistry};
use super::violation::{BackoffPolicy, ViolationTracker};
use crate::error::Result;

/// Span counted as "recent" in [`Statistics`].
const RECENT_SPAN: Duration = Duration::from_secs(60);

/// Engine behaviour that is not tied to a single limit.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Backoff curve for repeat offenders
    pub backoff: BackoffPolicy,
    /// Count requests made while in the penalty box as further violations
    pub escalate_during_backoff: bool,
    /// Identifier of the per-user tier in multi-tier checks
    pub user_tier: String,
    /// Identifier of the global tier in multi-tier checks
    pub global_tier: String,
    /// How long a quiet violation record is kept
    pub violation_retention: Duration,
    /// How long an idle, full burst bucket is kept
    pub bucket_retention: Duration,
    /// Suspicious activity detection, disabled when `None`
    pub detector: Option<DetectorConfig>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            escalate_during_backoff: true,
            user_tier: "user".to_string(),
            global_tier: "global".to_string(),
            violation_retention: Duration::from_secs(3600),
            bucket_retention: Duration::from_secs(3600),
            detector: None,
        }
    }
}

/// Mutable per-key state, always accessed under one lock.
#[derive(Debug, Default)]
struct LimiterState {
    windows: super::window::SlidingWindowStore,
    violations: ViolationTracker,
    buckets: BurstBucketController,
}

/// The in-process rate limiting engine.
///
/// This struct is thread-safe; construct it once and share it as
/// `Arc<RateLimiter>`.
pub struct RateLimiter {
    /// Configured limits by identifier
    limits: RwLock<RateLimitRegistry>,
    /// Windows, violation records and burst buckets
    state: RwLock<LimiterState>,
    settings: LimiterSettings,
    detector: Option<SuspiciousActivityDetector>,
}

impl RateLimiter {
    /// Create a rate limiter with default settings and no limits.
    pub fn new() -> Self {
        Self::with_settings(LimiterSettings::default())
    }

    /// Create a rate limiter with the given settings.
    pub fn with_settings(settings: LimiterSettings) -> Self {
        let detector = settings.detector.clone().map(SuspiciousActivityDetector::new);
        Self {
            limits: RwLock::new(RateLimitRegistry::new()),
            state: RwLock::new(LimiterState {
                violations: ViolationTracker::new(settings.backoff),
                ..Default::default()
            }),
            settings,
            detector,
        }
    }

    /// Create a rate limiter with settings and a prepared registry.
    pub fn with_registry(settings: LimiterSettings, registry: RateLimitRegistry) -> Self {
        let limiter = Self::with_settings(settings);
        *limiter.limits.write() = registry;
        limiter
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Register or replace the limit for `limit.identifier`.
    pub fn set_rate_limit(&self, limit: RateLimit) -> Result<()> {
        debug!(
            identifier = %limit.identifier,
            requests = limit.requests,
            window = ?limit.window,
            "Registering rate limit"
        );
        self.limits.write().register(limit)
    }

    pub fn remove_rate_limit(&self, identifier: &str) -> Option<Arc<RateLimit>> {
        self.limits.write().remove(identifier)
    }

    /// Get the limit registered for `identifier`.
    pub fn rate_limit(&self, identifier: &str) -> Option<Arc<RateLimit>> {
        self.limits.read().get(identifier)
    }

    /// Check and record one request for `identifier`, namespaced by `user`.
    pub fn check_rate_limit(&self, identifier: &str, user: Option<&str>) -> RateLimitResult {
        self.check_rate_limit_at(identifier, user, Instant::now())
    }

    /// [`check_rate_limit`](Self::check_rate_limit) at an explicit time.
    pub fn check_rate_limit_at(
        &self,
        identifier: &str,
        user: Option<&str>,
        now: Instant,
    ) -> RateLimitResult {
        let Some(limit) = self.rate_limit(identifier) else {
            trace!(identifier = %identifier, "No rate limit configured");
            return RateLimitResult::unlimited(now);
        };

        let key = LimitKey::new(identifier, user);
        let key_str = key.to_string_key();

        trace!(key = %key, "Checking rate limit");

        let mut guard = self.state.write();
        let state = &mut *guard;

        // An active penalty overrides everything else.
        if let Some(active) = state.violations.active_backoff(&key, now).cloned() {
            let record = if self.settings.escalate_during_backoff {
                state.violations.penalize(&key, now)
            } else {
                active
            };
            let retry_after = record.remaining_backoff(now).unwrap_or_default();
            let reset_time = window_reset(&state.windows, &key, &limit, now);

            warn!(
                key = %key,
                violation_count = record.total_violations,
                consecutive = record.consecutive_violations,
                retry_after = ?retry_after,
                "Request denied during backoff"
            );
            return RateLimitResult::deny(
                key_str,
                limit.requests,
                reset_time,
                retry_after,
                record.total_violations,
            );
        }

        let count = state.windows.count(&key, limit.window, now);

        if count >= limit.requests {
            let record = state.violations.penalize(&key, now);
            let retry_after = record.remaining_backoff(now).unwrap_or_default();
            let reset_time = window_reset(&state.windows, &key, &limit, now);

            warn!(
                key = %key,
                count = count,
                limit = limit.requests,
                violation_count = record.total_violations,
                retry_after = ?retry_after,
                "Rate limit exceeded"
            );
            return RateLimitResult::deny(
                key_str,
                limit.requests,
                reset_time,
                retry_after,
                record.total_violations,
            );
        }

        if let (Some(detector), Some(entries)) = (&self.detector, state.windows.entries(&key)) {
            if let Some(suspicion) = detector.inspect(entries, now) {
                let record = state
                    .violations
                    .impose(&key, now, detector.config().penalty);
                let retry_after = record.remaining_backoff(now).unwrap_or_default();
                let reset_time = window_reset(&state.windows, &key, &limit, now);

                warn!(
                    key = %key,
                    suspicion = %suspicion,
                    violation_count = record.total_violations,
                    retry_after = ?retry_after,
                    "Suspicious activity detected"
                );
                return RateLimitResult::deny(
                    key_str,
                    limit.requests,
                    reset_time,
                    retry_after,
                    record.total_violations,
                );
            }
        }

        let violation_count = state
            .violations
            .get(&key)
            .map(|r| r.total_violations)
            .unwrap_or(0);

        if let Some(burst) = limit.burst {
            let decision =
                state
                    .buckets
                    .try_consume(&key, burst.capacity, burst.refill_per_sec, now);
            if !decision.allowed {
                let retry_after = decision.retry_after.unwrap_or_default();
                let reset_time = window_reset(&state.windows, &key, &limit, now);
                debug!(
                    key = %key,
                    tokens = decision.remaining_tokens,
                    retry_after = ?retry_after,
                    "Burst capacity exhausted"
                );
                return RateLimitResult::deny(
                    key_str,
                    limit.requests,
                    reset_time,
                    retry_after,
                    violation_count,
                );
            }
        }

        state.windows.append(&key, now, 1);
        state.violations.reset_on_success(&key);
        let reset_time = window_reset(&state.windows, &key, &limit, now);

        RateLimitResult::allow(
            key_str,
            limit.requests,
            limit.requests - count - 1,
            reset_time,
            violation_count,
        )
    }

    /// Check the per-user, per-endpoint and optionally global tiers in order,
    /// stopping at the first denial.
    pub fn check_multiple_limits(&self, user_id: &str, endpoint: &str, global: bool) -> RateLimitResult {
        self.check_multiple_limits_at(user_id, endpoint, global, Instant::now())
    }

    /// [`check_multiple_limits`](Self::check_multiple_limits) at an explicit time.
    pub fn check_multiple_limits_at(
        &self,
        user_id: &str,
        endpoint: &str,
        global: bool,
        now: Instant,
    ) -> RateLimitResult {
        let mut tiers = vec![
            (self.settings.user_tier.as_str(), Some(user_id)),
            (endpoint, None),
        ];
        if global {
            tiers.push((self.settings.global_tier.as_str(), None));
        }

        let mut results = Vec::with_capacity(tiers.len());
        for (identifier, user) in tiers {
            let result = self.check_rate_limit_at(identifier, user, now);
            if !result.allowed {
                debug!(
                    user_id = %user_id,
                    endpoint = %endpoint,
                    tier = %identifier,
                    "Multi-tier check denied"
                );
                return result;
            }
            results.push(result);
        }

        combine_allowed(results, now)
    }

    /// Take one token from a standalone burst bucket for `identifier`.
    ///
    /// The bucket parameters are validated like a configured [`BurstConfig`].
    pub fn check_burst(
        &self,
        identifier: &str,
        user: Option<&str>,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<BurstDecision> {
        self.check_burst_at(identifier, user, capacity, refill_rate, Instant::now())
    }

    pub fn check_burst_at(
        &self,
        identifier: &str,
        user: Option<&str>,
        capacity: f64,
        refill_rate: f64,
        now: Instant,
    ) -> Result<BurstDecision> {
        BurstConfig::new(capacity, refill_rate).validate(identifier)?;
        let key = LimitKey::new(identifier, user);
        let decision = self
            .state
            .write()
            .buckets
            .try_consume(&key, capacity, refill_rate, now);
        trace!(key = %key, allowed = decision.allowed, tokens = decision.remaining_tokens, "Burst check");
        Ok(decision)
    }

    /// Charge `count` requests to a key without making a decision.
    ///
    /// Identifiers without a configured limit are ignored.
    pub fn increment_count(&self, identifier: &str, user: Option<&str>, count: u64) {
        self.increment_count_at(identifier, user, count, Instant::now())
    }

    pub fn increment_count_at(&self, identifier: &str, user: Option<&str>, count: u64, now: Instant) {
        if count == 0 || self.rate_limit(identifier).is_none() {
            return;
        }
        let key = LimitKey::new(identifier, user);
        trace!(key = %key, count = count, "Incrementing request count");
        self.state.write().windows.append(&key, now, count);
    }

    /// Forget all state for one key.
    ///
    /// Without a user, every key under `identifier` is reset. The distributed
    /// engine only resets the shared key in that case.
    pub fn reset(&self, identifier: &str, user: Option<&str>) {
        let mut state = self.state.write();
        match user {
            Some(user) => {
                let key = LimitKey::new(identifier, Some(user));
                state.windows.remove(&key);
                state.violations.remove(&key);
                state.buckets.remove(&key);
            }
            None => {
                state.windows.remove_identifier(identifier);
                state.violations.remove_identifier(identifier);
                state.buckets.remove_identifier(identifier);
            }
        }
        debug!(identifier = %identifier, user = ?user, "Rate limit state reset");
    }

    /// Forget all per-key state. Registered limits are kept.
    pub fn reset_all(&self) {
        let mut state = self.state.write();
        state.windows.clear();
        state.violations.clear();
        state.buckets.clear();
        debug!("All rate limit state reset");
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics_at(Instant::now())
    }

    pub fn statistics_at(&self, now: Instant) -> Statistics {
        let state = self.state.read();
        Statistics {
            active_windows: state.windows.active_windows(),
            total_requests: state.windows.total_requests(),
            recent_requests: state.windows.recent_requests(RECENT_SPAN, now),
            total_violations: state.violations.total_violations(),
            active_violations: state.violations.active_violations(now),
            burst_buckets: state.buckets.len(),
        }
    }

    /// Remove state that has returned to its quiet default.
    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> CleanupReport {
        let windows: HashMap<String, Duration> = self
            .limits
            .read()
            .iter()
            .map(|l| (l.identifier.clone(), l.window))
            .collect();

        let mut state = self.state.write();
        let report = CleanupReport {
            windows_removed: state
                .windows
                .purge_expired(now, |key| windows.get(&key.identifier).copied()),
            violations_removed: state
                .violations
                .purge_expired(now, self.settings.violation_retention),
            buckets_removed: state.buckets.purge_idle(now, self.settings.bucket_retention),
        };
        drop(state);

        debug!(
            windows_removed = report.windows_removed,
            violations_removed = report.violations_removed,
            buckets_removed = report.buckets_removed,
            "Rate limit cleanup finished"
        );
        report
    }

    /// Run [`cleanup`](Self::cleanup) every `every` until `shutdown` resolves.
    pub fn spawn_cleanup<F>(self: &Arc<Self>, every: Duration, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let limiter = Arc::clone(self);
        spawn_periodic(every, shutdown, move || {
            limiter.cleanup();
        })
    }
}

/// Call `tick` every `every` until `shutdown` resolves.
pub(crate) fn spawn_periodic<F, T>(every: Duration, shutdown: F, tick: T) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
    T: Fn() + Send + 'static,
{
    let every = every.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        tokio::pin!(shutdown);

        info!(interval = ?every, "Rate limit cleanup task started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => tick(),
            }
        }
        info!("Rate limit cleanup task stopped");
    })
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check_rate_limit(&self, identifier: &str, user: Option<&str>) -> RateLimitResult {
        RateLimiter::check_rate_limit(self, identifier, user)
    }

    async fn check_multiple_limits(
        &self,
        user_id: &str,
        endpoint: &str,
        global: bool,
    ) -> RateLimitResult {
        RateLimiter::check_multiple_limits(self, user_id, endpoint, global)
    }
}

/// When the oldest counted request leaves the window.
fn window_reset(
    windows: &super::window::SlidingWindowStore,
    key: &LimitKey,
    limit: &RateLimit,
    now: Instant,
) -> Instant {
    windows.oldest(key).unwrap_or(now) + limit.window
}

/// Merge allowed tier results into the tightest view.
pub(crate) fn combine_allowed(results: Vec<RateLimitResult>, now: Instant) -> RateLimitResult {
    let reset_time = results
        .iter()
        .filter(|r| !r.is_unlimited())
        .map(|r| r.reset_time)
        .min();

    let tightest = results
        .into_iter()
        .min_by_key(|r| r.remaining_requests);

    match tightest {
        Some(mut result) => {
            result.reset_time = reset_time.unwrap_or(now);
            result
        }
        None => RateLimitResult::unlimited(now),
    }
}
