//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::result::RateLimitResult;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the local `RateLimiter` and the
/// `DistributedRateLimiter` so that request guards can work with either.
///
/// Resetting state is not part of the trait because the two engines scope it
/// differently. `RateLimiter::reset(identifier, None)` clears every user under
/// the identifier, while `DistributedRateLimiter::reset(identifier, None)`
/// clears only the shared key. Reset each user explicitly when the backend
/// may be distributed.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check and record one request for `identifier`, namespaced by `user`.
    async fn check_rate_limit(&self, identifier: &str, user: Option<&str>) -> RateLimitResult;

    /// Check the per-user, per-endpoint and optionally global tiers in order,
    /// stopping at the first denial.
    async fn check_multiple_limits(
        &self,
        user_id: &str,
        endpoint: &str,
        global: bool,
    ) -> RateLimitResult;
}
