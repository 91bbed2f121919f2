//! Request-boundary guard.
//!
//! [`RateLimitGuard`] turns a verdict from any [`RateLimiterBackend`] into a
//! `Result`, so a handler can bail out with `?` and translate the
//! [`RateLimitExceeded`] into a "too many requests" response.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::ratelimit::{RateLimitResult, RateLimiterBackend};

/// A request was rejected by the rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitExceeded {
    /// The verdict that rejected the request
    pub result: RateLimitResult,
}

impl RateLimitExceeded {
    /// HTTP status for a rejected request.
    pub const STATUS_CODE: u16 = 429;

    pub fn status_code(&self) -> u16 {
        Self::STATUS_CODE
    }

    /// Whole seconds the caller should wait, rounded up and at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let retry = self.result.retry_after.unwrap_or_default();
        let secs = retry.as_secs().saturating_add(u64::from(retry.subsec_nanos() > 0));
        secs.max(1)
    }

    /// Response headers advertising the limit state.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Retry-After", self.retry_after_secs().to_string())];
        if let Some(limit) = self.result.limit {
            headers.push(("X-RateLimit-Limit", limit.to_string()));
        }
        headers.push((
            "X-RateLimit-Remaining",
            self.result.remaining_requests.to_string(),
        ));
        let reset = self.result.reset_after(Instant::now());
        headers.push(("X-RateLimit-Reset", reset.as_secs().to_string()));
        headers
    }
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rate limit exceeded. Try again in {} seconds.",
            self.retry_after_secs()
        )
    }
}

impl std::error::Error for RateLimitExceeded {}

/// Guard wrapping a rate limiter backend.
pub struct RateLimitGuard<R: RateLimiterBackend + ?Sized> {
    backend: Arc<R>,
}

impl<R: RateLimiterBackend + ?Sized> Clone for RateLimitGuard<R> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<R: RateLimiterBackend + ?Sized> RateLimitGuard<R> {
    pub fn new(backend: Arc<R>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<R> {
        &self.backend
    }

    /// Check one request against `identifier`.
    pub async fn check(
        &self,
        identifier: &str,
        user: Option<&str>,
    ) -> Result<RateLimitResult, RateLimitExceeded> {
        let result = self.backend.check_rate_limit(identifier, user).await;
        Self::verdict(result)
    }

    /// Check one request against the user, endpoint and optional global tiers.
    pub async fn check_tiers(
        &self,
        user_id: &str,
        endpoint: &str,
        global: bool,
    ) -> Result<RateLimitResult, RateLimitExceeded> {
        let result = self
            .backend
            .check_multiple_limits(user_id, endpoint, global)
            .await;
        Self::verdict(result)
    }

    /// Run `operation` only if the request is allowed.
    pub async fn protect<F, T>(
        &self,
        identifier: &str,
        user: Option<&str>,
        operation: F,
    ) -> Result<T, RateLimitExceeded>
    where
        F: Future<Output = T>,
    {
        self.check(identifier, user).await?;
        Ok(operation.await)
    }

    fn verdict(result: RateLimitResult) -> Result<RateLimitResult, RateLimitExceeded> {
        if result.allowed {
            Ok(result)
        } else {
            debug!(key = ?result.key, retry_after = ?result.retry_after, "Request rejected at guard");
            Err(RateLimitExceeded { result })
        }
    }
}

/// Resolve a stable client identifier for a request.
///
/// A bearer token wins (its last eight characters, prefixed `auth_`), then
/// the first `X-Forwarded-For` hop, then the peer address.
pub fn client_id<'a, I>(headers: I, peer: Option<IpAddr>) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut forwarded = None;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("authorization") {
            if let Some(token) = value.split_whitespace().nth(1) {
                let start = token
                    .char_indices()
                    .rev()
                    .nth(7)
                    .map_or(0, |(idx, _)| idx);
                return format!("auth_{}", &token[start..]);
            }
        } else if name.eq_ignore_ascii_case("x-forwarded-for") && forwarded.is_none() {
            let hop = value.split(',').next().unwrap_or_default().trim();
            if !hop.is_empty() {
                forwarded = Some(hop.to_string());
            }
        }
    }

    forwarded
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
