//! Violation tracking and exponential backoff.
//!
//! Every breach of a limit bumps the key's consecutive and lifetime violation
//! counters and puts the key in a penalty box whose length grows
//! exponentially with the consecutive count. While the penalty is active the
//! key is denied regardless of its window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::key::LimitKey;
use super::rules::MAX_PERIOD;
use crate::error::{Result, WardenError};

/// Exponential backoff curve with a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Backoff applied for the first violation
    pub base: Duration,
    /// Growth factor per additional consecutive violation
    pub multiplier: f64,
    /// Upper bound on any backoff
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Result<Self> {
        if base.is_zero() {
            return Err(WardenError::Config(
                "backoff base must be positive".to_string(),
            ));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(WardenError::Config(
                "backoff multiplier must be a finite value >= 1.0".to_string(),
            ));
        }
        if max < base {
            return Err(WardenError::Config(
                "backoff ceiling must not be below the base".to_string(),
            ));
        }
        if max > MAX_PERIOD {
            return Err(WardenError::Config(format!(
                "backoff ceiling must not exceed {:?}",
                MAX_PERIOD
            )));
        }
        Ok(Self {
            base,
            multiplier,
            max,
        })
    }

    /// Backoff for the given number of consecutive violations.
    ///
    /// `min(base * multiplier^(violations - 1), max)`; the first violation
    /// already yields `base`.
    pub fn backoff(&self, consecutive_violations: u32) -> Duration {
        if consecutive_violations == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_violations - 1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Violation history for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationRecord {
    /// Time of the most recent violation
    pub timestamp: Instant,
    /// Violations since the last allowed request
    pub consecutive_violations: u32,
    /// Violations over the lifetime of this record
    pub total_violations: u64,
    /// While in the future, the key is denied unconditionally
    pub backoff_until: Option<Instant>,
}

impl ViolationRecord {
    /// Whether the penalty box is active at `now`.
    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Time left in the penalty box, if any.
    pub fn remaining_backoff(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }
}

/// Per-key violation records.
#[derive(Debug, Default)]
pub struct ViolationTracker {
    records: HashMap<LimitKey, ViolationRecord>,
    policy: BackoffPolicy,
}

impl ViolationTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            records: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Count one more violation for `key`, starting a record at 1/1 if absent.
    pub fn record_violation(&mut self, key: &LimitKey, now: Instant) -> &mut ViolationRecord {
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| ViolationRecord {
                timestamp: now,
                consecutive_violations: 0,
                total_violations: 0,
                backoff_until: None,
            });
        record.timestamp = now;
        record.consecutive_violations = record.consecutive_violations.saturating_add(1);
        record.total_violations = record.total_violations.saturating_add(1);
        record
    }

    /// Record a violation and put the key in the penalty box for the backoff
    /// matching its new consecutive count.
    ///
    /// A longer penalty already in place is never shortened.
    pub fn penalize(&mut self, key: &LimitKey, now: Instant) -> ViolationRecord {
        let policy = self.policy;
        let record = self.record_violation(key, now);
        let backoff = policy.backoff(record.consecutive_violations);
        extend_backoff(record, now + backoff);
        record.clone()
    }

    /// Record a violation with an explicit penalty length.
    pub fn impose(&mut self, key: &LimitKey, now: Instant, penalty: Duration) -> ViolationRecord {
        let record = self.record_violation(key, now);
        extend_backoff(record, now + penalty);
        record.clone()
    }

    /// Clear the violation streak after an allowed request.
    ///
    /// `total_violations` is preserved.
    pub fn reset_on_success(&mut self, key: &LimitKey) {
        if let Some(record) = self.records.get_mut(key) {
            record.consecutive_violations = 0;
            record.backoff_until = None;
        }
    }

    /// The record for `key` if its penalty box is active at `now`.
    pub fn active_backoff(&self, key: &LimitKey, now: Instant) -> Option<&ViolationRecord> {
        self.records.get(key).filter(|r| r.is_backing_off(now))
    }

    pub fn get(&self, key: &LimitKey) -> Option<&ViolationRecord> {
        self.records.get(key)
    }

    pub fn remove(&mut self, key: &LimitKey) {
        self.records.remove(key);
    }

    pub fn remove_identifier(&mut self, identifier: &str) {
        self.records.retain(|k, _| k.identifier != identifier);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn total_violations(&self) -> u64 {
        self.records.values().map(|r| r.total_violations).sum()
    }

    /// Number of keys currently in the penalty box.
    pub fn active_violations(&self, now: Instant) -> usize {
        self.records.values().filter(|r| r.is_backing_off(now)).count()
    }

    /// Drop records with no active backoff whose last violation is older
    /// than `retention`. Returns the number of records removed.
    pub fn purge_expired(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            record.is_backing_off(now) || now.saturating_duration_since(record.timestamp) <= retention
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn extend_backoff(record: &mut ViolationRecord, until: Instant) {
    record.backoff_until = Some(match record.backoff_until {
        Some(existing) if existing > until => existing,
        _ => until,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LimitKey {
        LimitKey::shared("x")
    }

    #[test]
    fn test_default_backoff_curve() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(13), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for v in 1..200 {
            let current = policy.backoff(v);
            assert!(current >= previous, "backoff({}) decreased", v);
            assert!(current <= policy.max);
            previous = current;
        }
        assert_eq!(policy.backoff(u32::MAX), policy.max);
    }

    #[test]
    fn test_policy_validation() {
        assert!(BackoffPolicy::new(Duration::ZERO, 2.0, Duration::from_secs(1)).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), 0.5, Duration::from_secs(10)).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(10), 2.0, Duration::from_secs(1)).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), 1.0, Duration::from_secs(1)).is_ok());
        assert!(BackoffPolicy::new(Duration::from_secs(1), 2.0, MAX_PERIOD * 2).is_err());
    }

    #[test]
    fn test_first_violation_starts_at_one() {
        let mut tracker = ViolationTracker::default();
        let now = Instant::now();

        let record = tracker.penalize(&key(), now);

        assert_eq!(record.consecutive_violations, 1);
        assert_eq!(record.total_violations, 1);
        assert_eq!(record.backoff_until, Some(now + Duration::from_secs(1)));
        assert!(tracker.active_backoff(&key(), now).is_some());
        assert!(tracker.active_backoff(&key(), now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_success_resets_streak_but_not_total() {
        let mut tracker = ViolationTracker::default();
        let now = Instant::now();

        tracker.penalize(&key(), now);
        tracker.penalize(&key(), now);
        tracker.reset_on_success(&key());

        let record = tracker.get(&key()).unwrap();
        assert_eq!(record.consecutive_violations, 0);
        assert_eq!(record.total_violations, 2);
        assert_eq!(record.backoff_until, None);

        let record = tracker.penalize(&key(), now);
        assert_eq!(record.consecutive_violations, 1);
        assert_eq!(record.total_violations, 3);
    }

    #[test]
    fn test_impose_never_shortens_penalty() {
        let mut tracker = ViolationTracker::default();
        let now = Instant::now();

        tracker.impose(&key(), now, Duration::from_secs(3600));
        let record = tracker.penalize(&key(), now);

        assert_eq!(record.remaining_backoff(now), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_purge_keeps_active_and_recent_records() {
        let mut tracker = ViolationTracker::default();
        let t0 = Instant::now();
        let boxed = LimitKey::shared("boxed");
        let recent = LimitKey::shared("recent");

        tracker.penalize(&key(), t0);
        tracker.impose(&boxed, t0, Duration::from_secs(7200));
        tracker.penalize(&recent, t0 + Duration::from_secs(3000));

        let removed = tracker.purge_expired(t0 + Duration::from_secs(3601), Duration::from_secs(3600));

        assert_eq!(removed, 1);
        assert!(tracker.get(&key()).is_none());
        assert!(tracker.get(&boxed).is_some());
        assert!(tracker.get(&recent).is_some());
    }

    #[test]
    fn test_active_violation_count() {
        let mut tracker = ViolationTracker::default();
        let now = Instant::now();
        tracker.penalize(&key(), now);
        tracker.penalize(&LimitKey::shared("y"), now);

        assert_eq!(tracker.active_violations(now), 2);
        assert_eq!(tracker.active_violations(now + Duration::from_secs(2)), 0);
        assert_eq!(tracker.total_violations(), 2);
    }
}
