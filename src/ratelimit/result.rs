//! Values returned by rate limit checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Outcome of a rate limit check. Constructed fresh for every call.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window; `u64::MAX` when unlimited
    pub remaining_requests: u64,
    /// When the tightest constraint frees up
    pub reset_time: Instant,
    /// How long a denied caller should wait; always set on denial
    pub retry_after: Option<Duration>,
    /// Lifetime violations recorded for the key
    pub violation_count: u64,
    /// Configured request limit, if any
    pub limit: Option<u64>,
    /// Key that produced this verdict, if a limit applied
    pub key: Option<String>,
}

impl RateLimitResult {
    /// Result for an identifier with no configured limit.
    pub fn unlimited(now: Instant) -> Self {
        Self {
            allowed: true,
            remaining_requests: u64::MAX,
            reset_time: now,
            retry_after: None,
            violation_count: 0,
            limit: None,
            key: None,
        }
    }

    pub fn allow(
        key: impl Into<String>,
        limit: u64,
        remaining_requests: u64,
        reset_time: Instant,
        violation_count: u64,
    ) -> Self {
        Self {
            allowed: true,
            remaining_requests,
            reset_time,
            retry_after: None,
            violation_count,
            limit: Some(limit),
            key: Some(key.into()),
        }
    }

    pub fn deny(
        key: impl Into<String>,
        limit: u64,
        reset_time: Instant,
        retry_after: Duration,
        violation_count: u64,
    ) -> Self {
        Self {
            allowed: false,
            remaining_requests: 0,
            reset_time,
            retry_after: Some(retry_after),
            violation_count,
            limit: Some(limit),
            key: Some(key.into()),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }

    /// Time from `now` until `reset_time`.
    pub fn reset_after(&self, now: Instant) -> Duration {
        self.reset_time.saturating_duration_since(now)
    }

    /// Convert to a wall-clock, serializable report.
    pub fn to_report(&self) -> RateLimitReport {
        let until_reset = self.reset_after(Instant::now());
        let now = Utc::now();
        let reset_at = chrono::Duration::from_std(until_reset)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RateLimitReport {
            allowed: self.allowed,
            remaining_requests: (!self.is_unlimited()).then_some(self.remaining_requests),
            limit: self.limit,
            reset_at,
            retry_after_secs: self.retry_after.map(|d| d.as_secs_f64()),
            violation_count: self.violation_count,
            key: self.key.clone(),
        }
    }
}

/// Wall-clock rendering of a [`RateLimitResult`] for logs and external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitReport {
    pub allowed: bool,
    pub remaining_requests: Option<u64>,
    pub limit: Option<u64>,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<f64>,
    pub violation_count: u64,
    pub key: Option<String>,
}

/// Snapshot of the engine's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Keys with at least one request in their log
    pub active_windows: usize,
    /// Requests held across all logs
    pub total_requests: u64,
    /// Requests recorded in the last minute
    pub recent_requests: u64,
    /// Lifetime violations across all tracked keys
    pub total_violations: u64,
    /// Keys currently in the penalty box
    pub active_violations: usize,
    /// Burst buckets currently tracked
    pub burst_buckets: usize,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub windows_removed: usize,
    pub violations_removed: usize,
    pub buckets_removed: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.windows_removed + self.violations_removed + self.buckets_removed
    }
}
