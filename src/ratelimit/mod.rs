//! Rate limiting logic and state management.

mod backend;
mod burst;
mod detector;
mod distributed;
mod key;
mod limiter;
mod result;
mod rules;
mod violation;
mod window;

pub use backend::RateLimiterBackend;
pub use burst::{BurstBucket, BurstBucketController, BurstDecision};
pub use detector::{DetectorConfig, SuspiciousActivityDetector, Suspicion};
pub use distributed::{DistributedRateLimiter, DistributedSettings, FailurePolicy};
pub use key::LimitKey;
pub use limiter::{LimiterSettings, RateLimiter};
pub use result::{CleanupReport, RateLimitReport, RateLimitResult, Statistics};
pub use rules::{
    BurstConfig, Preset, RateLimit, RateLimitRegistry, RuleConfig, TimeUnit, MAX_PERIOD,
};
pub use violation::{BackoffPolicy, ViolationRecord, ViolationTracker};
pub use window::{SlidingWindowStore, WindowEntry};
