//! Token bucket burst handling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::key::LimitKey;

/// Token bucket state for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstBucket {
    pub tokens: f64,
    pub last_refill: Instant,
    pub capacity: f64,
    pub refill_rate: f64,
}

impl BurstBucket {
    fn full(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            capacity,
            refill_rate,
        }
    }

    /// Tokens the bucket would hold at `now`, without mutating it.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let gained = elapsed * self.refill_rate;
        if gained > 0.0 {
            (self.tokens + gained).min(self.capacity)
        } else {
            self.tokens.min(self.capacity)
        }
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Outcome of a burst check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstDecision {
    pub allowed: bool,
    pub remaining_tokens: f64,
    /// Time until one full token is available, set on denial
    pub retry_after: Option<Duration>,
}

/// Per-key token buckets with continuous refill.
#[derive(Debug, Default)]
pub struct BurstBucketController {
    buckets: HashMap<LimitKey, BurstBucket>,
}

impl BurstBucketController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill the bucket for `key`, then take one token if available.
    ///
    /// New buckets start full. A change of `capacity` or `refill_rate` is
    /// applied to an existing bucket before refilling.
    pub fn try_consume(
        &mut self,
        key: &LimitKey,
        capacity: f64,
        refill_rate: f64,
        now: Instant,
    ) -> BurstDecision {
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| BurstBucket::full(capacity, refill_rate, now));

        bucket.refill(now);
        bucket.capacity = capacity;
        bucket.refill_rate = refill_rate;
        bucket.tokens = bucket.tokens.min(capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            BurstDecision {
                allowed: true,
                remaining_tokens: bucket.tokens,
                retry_after: None,
            }
        } else {
            let missing = 1.0 - bucket.tokens;
            // Unrepresentable waits mean the bucket never refills.
            let wait = Duration::try_from_secs_f64(missing / refill_rate).unwrap_or(Duration::MAX);
            BurstDecision {
                allowed: false,
                remaining_tokens: bucket.tokens,
                retry_after: Some(wait),
            }
        }
    }

    pub fn get(&self, key: &LimitKey) -> Option<&BurstBucket> {
        self.buckets.get(key)
    }

    pub fn remove(&mut self, key: &LimitKey) {
        self.buckets.remove(key);
    }

    pub fn remove_identifier(&mut self, identifier: &str) {
        self.buckets.retain(|k, _| k.identifier != identifier);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Drop buckets that are full again and untouched for longer than
    /// `retention`. Returns the number of buckets removed.
    pub fn purge_idle(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill) > retention;
            let full = bucket.tokens_at(now) >= bucket.capacity;
            !(idle && full)
        });
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LimitKey {
        LimitKey::shared("burst")
    }

    #[test]
    fn test_full_bucket_allows_capacity_then_denies() {
        let mut controller = BurstBucketController::new();
        let now = Instant::now();

        for i in 0..5 {
            let decision = controller.try_consume(&key(), 5.0, 1.0, now);
            assert!(decision.allowed, "call {} should be allowed", i + 1);
        }

        let denied = controller.try_consume(&key(), 5.0, 1.0, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_tokens, 0.0);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_refill_allows_exactly_one_more() {
        let mut controller = BurstBucketController::new();
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(controller.try_consume(&key(), 3.0, 2.0, t0).allowed);
        }
        assert!(!controller.try_consume(&key(), 3.0, 2.0, t0).allowed);

        let later = t0 + Duration::from_millis(500);
        assert!(controller.try_consume(&key(), 3.0, 2.0, later).allowed);
        assert!(!controller.try_consume(&key(), 3.0, 2.0, later).allowed);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let mut controller = BurstBucketController::new();
        let t0 = Instant::now();
        controller.try_consume(&key(), 2.0, 1.0, t0);

        let decision = controller.try_consume(&key(), 2.0, 1.0, t0 + Duration::from_secs(100));
        assert!(decision.allowed);
        assert_eq!(decision.remaining_tokens, 1.0);
    }

    #[test]
    fn test_partial_tokens_report_partial_wait() {
        let mut controller = BurstBucketController::new();
        let t0 = Instant::now();
        assert!(controller.try_consume(&key(), 1.0, 1.0, t0).allowed);

        let decision = controller.try_consume(&key(), 1.0, 1.0, t0 + Duration::from_millis(250));
        assert!(!decision.allowed);
        let wait = decision.retry_after.unwrap().as_secs_f64();
        assert!((wait - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_purge_idle_only_removes_full_buckets() {
        let mut controller = BurstBucketController::new();
        let t0 = Instant::now();
        let slow = LimitKey::shared("slow");

        controller.try_consume(&key(), 5.0, 1.0, t0);
        // Refills one token per 10000 seconds, still empty after an hour.
        controller.try_consume(&slow, 1.0, 0.0001, t0);

        let removed = controller.purge_idle(t0 + Duration::from_secs(3601), Duration::from_secs(3600));

        assert_eq!(removed, 1);
        assert!(controller.get(&key()).is_none());
        assert!(controller.get(&slow).is_some());
    }

    #[test]
    fn test_degenerate_rate_denies_without_panicking() {
        let mut controller = BurstBucketController::new();
        let t0 = Instant::now();

        for rate in [0.0, -1.0, f64::NAN, 1e-300] {
            let key = LimitKey::shared(&format!("rate-{rate}"));
            assert!(controller.try_consume(&key, 1.0, rate, t0).allowed);

            let later = t0 + Duration::from_secs(10);
            let denied = controller.try_consume(&key, 1.0, rate, later);
            assert!(!denied.allowed, "rate {rate} should not refill a token");
            assert_eq!(denied.retry_after, Some(Duration::MAX));
        }
    }
}
