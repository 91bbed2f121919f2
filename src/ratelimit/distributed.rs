//! Rate limiter backed by a shared [`DistributedStore`].
//!
//! Each instance increments one counter per key and window in the store, so
//! every instance sees the same count. The counter is a fixed window that
//! starts with the first request, which approximates the local sliding
//! window. Violation records live in the store too, so a key in the penalty
//! box is denied by every instance.
//!
//! Burst buckets stay in process memory, so each instance smooths its own
//! share of the traffic. The suspicious activity detector needs the local
//! request log and is not available here.
//!
//! Penalty records are read, modified and written back without a
//! compare-and-swap. Two instances penalizing the same key at the same
//! moment may both write, and the last write wins. The counter itself is
//! atomic, so the quota is never exceeded; only a violation count can be
//! lost under such a race.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::burst::BurstBucketController;
use super::key::LimitKey;
use super::limiter::{combine_allowed, spawn_periodic, LimiterSettings};
use super::result::{CleanupReport, RateLimitResult};
use super::rules::{RateLimit, RateLimitRegistry};
use crate::error::{Result, WardenError};
use crate::store::DistributedStore;

/// What to answer when the store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Deny the request for one window.
    #[default]
    Closed,
    /// Let the request through.
    Open,
}

/// Settings for the distributed engine.
#[derive(Debug, Clone)]
pub struct DistributedSettings {
    /// Backoff, tier names and violation retention shared with the local engine
    pub limiter: LimiterSettings,
    /// Upper bound on each store call
    pub timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Prefix for every key written to the store
    pub key_prefix: String,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            limiter: LimiterSettings::default(),
            timeout: Duration::from_millis(250),
            failure_policy: FailurePolicy::Closed,
            key_prefix: "ratewarden".to_string(),
        }
    }
}

/// Violation history as stored in the shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredViolation {
    consecutive_violations: u32,
    total_violations: u64,
    /// Unix milliseconds; zero when no penalty was ever imposed
    backoff_until_ms: i64,
    last_violation_ms: i64,
}

impl StoredViolation {
    fn remaining_backoff(&self, now_ms: i64) -> Option<Duration> {
        (self.backoff_until_ms > now_ms)
            .then(|| Duration::from_millis((self.backoff_until_ms - now_ms) as u64))
    }
}

/// A rate limiter whose counters and penalties are shared through a store.
pub struct DistributedRateLimiter {
    store: Arc<dyn DistributedStore>,
    limits: RwLock<RateLimitRegistry>,
    buckets: Mutex<BurstBucketController>,
    settings: DistributedSettings,
}

impl DistributedRateLimiter {
    /// Create a distributed rate limiter with default settings.
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self::with_settings(store, DistributedSettings::default())
    }

    pub fn with_settings(store: Arc<dyn DistributedStore>, settings: DistributedSettings) -> Self {
        if settings.limiter.detector.is_some() {
            warn!("Suspicious activity detection is ignored by the distributed engine");
        }
        Self {
            store,
            limits: RwLock::new(RateLimitRegistry::new()),
            buckets: Mutex::new(BurstBucketController::new()),
            settings,
        }
    }

    /// Create a distributed rate limiter with a prepared registry.
    pub fn with_registry(
        store: Arc<dyn DistributedStore>,
        settings: DistributedSettings,
        registry: RateLimitRegistry,
    ) -> Self {
        let limiter = Self::with_settings(store, settings);
        *limiter.limits.write() = registry;
        limiter
    }

    pub fn settings(&self) -> &DistributedSettings {
        &self.settings
    }

    /// Register or replace the limit for `limit.identifier`.
    pub fn set_rate_limit(&self, limit: RateLimit) -> Result<()> {
        self.limits.write().register(limit)
    }

    pub fn remove_rate_limit(&self, identifier: &str) -> Option<Arc<RateLimit>> {
        self.limits.write().remove(identifier)
    }

    pub fn rate_limit(&self, identifier: &str) -> Option<Arc<RateLimit>> {
        self.limits.read().get(identifier)
    }

    /// Check and record one request, applying the failure policy when the
    /// store fails.
    pub async fn check_rate_limit(&self, identifier: &str, user: Option<&str>) -> RateLimitResult {
        let Some(limit) = self.rate_limit(identifier) else {
            return RateLimitResult::unlimited(Instant::now());
        };
        let key = LimitKey::new(identifier, user);

        match self.evaluate(&limit, &key).await {
            Ok(result) => result,
            Err(err) => self.fail(&limit, &key, err),
        }
    }

    /// Check and record one request, surfacing store failures.
    pub async fn try_check_rate_limit(
        &self,
        identifier: &str,
        user: Option<&str>,
    ) -> Result<RateLimitResult> {
        let Some(limit) = self.rate_limit(identifier) else {
            return Ok(RateLimitResult::unlimited(Instant::now()));
        };
        self.evaluate(&limit, &LimitKey::new(identifier, user)).await
    }

    /// Check the per-user, per-endpoint and optionally global tiers in order,
    /// stopping at the first denial.
    pub async fn check_multiple_limits(
        &self,
        user_id: &str,
        endpoint: &str,
        global: bool,
    ) -> RateLimitResult {
        let tiers = &self.settings.limiter;
        let mut checks = vec![(tiers.user_tier.as_str(), Some(user_id)), (endpoint, None)];
        if global {
            checks.push((tiers.global_tier.as_str(), None));
        }

        let mut results = Vec::with_capacity(checks.len());
        for (identifier, user) in checks {
            let result = self.check_rate_limit(identifier, user).await;
            if !result.allowed {
                return result;
            }
            results.push(result);
        }

        combine_allowed(results, Instant::now())
    }

    /// Delete the counter and violation record for one key.
    ///
    /// Without a user this resets the shared key of `identifier` only, unlike
    /// [`RateLimiter::reset`](super::RateLimiter::reset) which clears every
    /// user under the identifier. The store cannot enumerate per-user keys.
    pub async fn reset(&self, identifier: &str, user: Option<&str>) -> Result<()> {
        let limit_key = LimitKey::new(identifier, user);
        self.buckets.lock().remove(&limit_key);
        let key = limit_key.to_string_key();
        let window_key = self.window_key(&key);
        let penalty_key = self.penalty_key(&key);

        self.timed("delete", &window_key, self.store.delete(&window_key))
            .await?;
        self.timed("delete", &penalty_key, self.store.delete(&penalty_key))
            .await?;
        debug!(key = %key, "Distributed rate limit state reset");
        Ok(())
    }

    /// Drop this instance's idle burst buckets. Counters and penalty records
    /// expire in the store on their own.
    pub fn cleanup(&self) -> CleanupReport {
        let buckets_removed = self
            .buckets
            .lock()
            .purge_idle(Instant::now(), self.settings.limiter.bucket_retention);
        debug!(buckets_removed = buckets_removed, "Distributed cleanup finished");
        CleanupReport {
            buckets_removed,
            ..CleanupReport::default()
        }
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

    async fn evaluate(&self, limit: &RateLimit, limit_key: &LimitKey) -> Result<RateLimitResult> {
        let key = limit_key.to_string_key();
        let now = Instant::now();
        let now_ms = Utc::now().timestamp_millis();

        let mut record = self.load_violation(&key).await?.unwrap_or_default();

        if let Some(remaining) = record.remaining_backoff(now_ms) {
            let retry_after = if self.settings.limiter.escalate_during_backoff {
                self.penalize(&mut record, now_ms);
                self.save_violation(&key, &record).await?;
                record.remaining_backoff(now_ms).unwrap_or(remaining)
            } else {
                remaining
            };
            warn!(
                key = %key,
                violation_count = record.total_violations,
                retry_after = ?retry_after,
                "Request denied during backoff"
            );
            return Ok(RateLimitResult::deny(
                key,
                limit.requests,
                now + retry_after,
                retry_after,
                record.total_violations,
            ));
        }

        if let Some(burst) = limit.burst {
            let decision = self.buckets.lock().try_consume(
                limit_key,
                burst.capacity,
                burst.refill_per_sec,
                now,
            );
            if !decision.allowed {
                let retry_after = decision.retry_after.unwrap_or_default();
                debug!(key = %key, retry_after = ?retry_after, "Burst capacity exhausted");
                return Ok(RateLimitResult::deny(
                    key,
                    limit.requests,
                    now + limit.window,
                    retry_after,
                    record.total_violations,
                ));
            }
        }

        let window_key = self.window_key(&key);
        let count = self
            .timed("increment", &window_key, self.store.increment(&window_key, limit.window))
            .await?;
        trace!(key = %key, count = count, limit = limit.requests, "Distributed rate limit check");

        if count > limit.requests {
            self.penalize(&mut record, now_ms);
            self.save_violation(&key, &record).await?;
            let backoff = record.remaining_backoff(now_ms).unwrap_or_default();
            let retry_after = backoff.max(limit.window);
            warn!(
                key = %key,
                violation_count = record.total_violations,
                retry_after = ?retry_after,
                "Distributed rate limit exceeded"
            );
            return Ok(RateLimitResult::deny(
                key,
                limit.requests,
                now + limit.window,
                retry_after,
                record.total_violations,
            ));
        }

        if record.consecutive_violations > 0 {
            record.consecutive_violations = 0;
            self.save_violation(&key, &record).await?;
        }

        Ok(RateLimitResult::allow(
            key,
            limit.requests,
            limit.requests - count,
            now + limit.window,
            record.total_violations,
        ))
    }

    fn penalize(&self, record: &mut StoredViolation, now_ms: i64) {
        record.consecutive_violations = record.consecutive_violations.saturating_add(1);
        record.total_violations = record.total_violations.saturating_add(1);
        record.last_violation_ms = now_ms;
        let backoff = self
            .settings
            .limiter
            .backoff
            .backoff(record.consecutive_violations);
        record.backoff_until_ms = record
            .backoff_until_ms
            .max(now_ms + backoff.as_millis() as i64);
    }

    fn fail(&self, limit: &RateLimit, key: &LimitKey, err: WardenError) -> RateLimitResult {
        let now = Instant::now();
        let key = key.to_string_key();
        warn!(
            key = %key,
            error = %err,
            policy = ?self.settings.failure_policy,
            "Distributed store unavailable"
        );
        match self.settings.failure_policy {
            FailurePolicy::Closed => {
                RateLimitResult::deny(key, limit.requests, now + limit.window, limit.window, 0)
            }
            FailurePolicy::Open => {
                RateLimitResult::allow(key, limit.requests, limit.requests, now + limit.window, 0)
            }
        }
    }

    async fn load_violation(&self, key: &str) -> Result<Option<StoredViolation>> {
        let penalty_key = self.penalty_key(key);
        let Some(bytes) = self
            .timed("get", &penalty_key, self.store.get(&penalty_key))
            .await?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| WardenError::store("get", penalty_key, e))
    }

    async fn save_violation(&self, key: &str, record: &StoredViolation) -> Result<()> {
        let penalty_key = self.penalty_key(key);
        let bytes =
            serde_json::to_vec(record).map_err(|e| WardenError::store("set", &*penalty_key, e))?;

        // Keep the record at least until its penalty ends.
        let now_ms = Utc::now().timestamp_millis();
        let ttl = record
            .remaining_backoff(now_ms)
            .unwrap_or_default()
            .max(self.settings.limiter.violation_retention);

        self.timed("set", &penalty_key, self.store.set(&penalty_key, &bytes, ttl))
            .await
    }

    async fn timed<T, F>(&self, operation: &'static str, key: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::StoreTimeout {
                operation,
                key: key.to_string(),
                timeout: self.settings.timeout,
            }),
        }
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:window:{}", self.settings.key_prefix, key)
    }

    fn penalty_key(&self, key: &str) -> String {
        format!("{}:penalty:{}", self.settings.key_prefix, key)
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check_rate_limit(&self, identifier: &str, user: Option<&str>) -> RateLimitResult {
        DistributedRateLimiter::check_rate_limit(self, identifier, user).await
    }

    async fn check_multiple_limits(
        &self,
        user_id: &str,
        endpoint: &str,
        global: bool,
    ) -> RateLimitResult {
        DistributedRateLimiter::check_multiple_limits(self, user_id, endpoint, global).await
    }
}
