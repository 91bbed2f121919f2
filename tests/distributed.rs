//! The distributed engine and the request guard over a shared store.

use std::sync::Arc;
use std::time::Duration;

use ratewarden::config::WardenConfig;
use ratewarden::middleware::{client_id, RateLimitGuard};
use ratewarden::ratelimit::{DistributedRateLimiter, RateLimit, RateLimiter, RateLimiterBackend};
use ratewarden::store::{DistributedStore, MemoryStore};

fn distributed(store: Arc<dyn DistributedStore>, requests: u64) -> Arc<DistributedRateLimiter> {
    let limiter = DistributedRateLimiter::new(store);
    limiter
        .set_rate_limit(RateLimit::new("translate", requests, Duration::from_secs(60)).unwrap())
        .unwrap();
    Arc::new(limiter)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instances_share_one_quota() {
    let store: Arc<dyn DistributedStore> = Arc::new(MemoryStore::new());
    let instances = [distributed(store.clone(), 5), distributed(store, 5)];

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let limiter = Arc::clone(&instances[i % 2]);
            tokio::spawn(async move { limiter.check_rate_limit("translate", Some("u1")).await })
        })
        .collect();

    let allowed = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.allowed)
        .count();

    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn guard_rejects_with_retry_hint() {
    let backend: Arc<dyn RateLimiterBackend> = distributed(Arc::new(MemoryStore::new()), 1);
    let guard = RateLimitGuard::new(backend);

    let client = client_id([("Authorization", "Bearer token-1234abcd")], None);
    assert_eq!(client, "auth_1234abcd");

    assert!(guard.check("translate", Some(&client)).await.is_ok());

    let rejected = guard.check("translate", Some(&client)).await.unwrap_err();
    assert_eq!(rejected.status_code(), 429);
    assert_eq!(rejected.retry_after_secs(), 60);
    assert!(rejected
        .headers()
        .iter()
        .any(|(name, value)| *name == "Retry-After" && value == "60"));
}

#[tokio::test]
async fn configured_memory_backend_end_to_end() {
    let config = WardenConfig::from_yaml(
        r#"
limits:
  - identifier: user
    requests: 2
    unit: minute
  - identifier: /translate
    preset: moderate
distributed:
  backend: memory
"#,
    )
    .unwrap();

    let store = config.connect_store().await.unwrap().unwrap();
    let limiter = config.build_distributed(store).unwrap();

    assert!(limiter.check_multiple_limits("u1", "/translate", false).await.allowed);
    assert!(limiter.check_multiple_limits("u1", "/translate", false).await.allowed);

    let denied = limiter.check_multiple_limits("u1", "/translate", false).await;
    assert!(!denied.allowed);
    assert_eq!(denied.key.as_deref(), Some("user:u1"));

    limiter.reset("user", Some("u1")).await.unwrap();
    assert!(limiter.check_multiple_limits("u1", "/translate", false).await.allowed);
}

#[tokio::test]
async fn reset_without_user_is_scoped_per_engine() {
    let local = RateLimiter::new();
    local
        .set_rate_limit(RateLimit::new("translate", 1, Duration::from_secs(60)).unwrap())
        .unwrap();
    let shared = distributed(Arc::new(MemoryStore::new()), 1);

    assert!(local.check_rate_limit("translate", Some("u1")).allowed);
    assert!(shared.check_rate_limit("translate", Some("u1")).await.allowed);

    local.reset("translate", None);
    shared.reset("translate", None).await.unwrap();

    // The local engine clears every user, the shared store only the shared key
    assert!(local.check_rate_limit("translate", Some("u1")).allowed);
    assert!(!shared.check_rate_limit("translate", Some("u1")).await.allowed);

    shared.reset("translate", Some("u1")).await.unwrap();
    assert!(shared.check_rate_limit("translate", Some("u1")).await.allowed);
}
