//! Configuration management for Ratewarden.
//!
//! Configuration is read from a YAML, TOML or JSON file and layered with
//! `RATEWARDEN__SECTION__FIELD` environment overrides. Every field has a
//! default, so an empty file is a valid configuration with no limits.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::{
    BackoffPolicy, DetectorConfig, DistributedRateLimiter, DistributedSettings, FailurePolicy,
    LimiterSettings, RateLimitRegistry, RateLimiter, RuleConfig, MAX_PERIOD,
};
use crate::store::{ClusterConfig, ClusterStore, DistributedStore, MemoryStore};

/// Main configuration for the Ratewarden engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Rate limit rules
    #[serde(default)]
    pub limits: Vec<RuleConfig>,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Identifiers used by multi-tier checks
    #[serde(default)]
    pub tiers: TierConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Suspicious activity detection
    #[serde(default)]
    pub detector: DetectorSettings,

    /// Shared store for multi-instance deployments
    #[serde(default)]
    pub distributed: DistributedConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backoff curve for repeat offenders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_secs: f64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_backoff_max")]
    pub max_secs: f64,

    /// Count requests made during a penalty as further violations
    #[serde(default = "default_true")]
    pub escalate_during_backoff: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            multiplier: default_backoff_multiplier(),
            max_secs: default_backoff_max(),
            escalate_during_backoff: true,
        }
    }
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> f64 {
    3600.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default = "default_user_tier")]
    pub user: String,

    #[serde(default = "default_global_tier")]
    pub global: String,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            user: default_user_tier(),
            global: default_global_tier(),
        }
    }
}

fn default_user_tier() -> String {
    "user".to_string()
}

fn default_global_tier() -> String {
    "global".to_string()
}

/// Periodic pruning of quiet state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_retention")]
    pub violation_retention_secs: u64,

    #[serde(default = "default_retention")]
    pub bucket_retention_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            violation_retention_secs: default_retention(),
            bucket_retention_secs: default_retention(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_retention() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_burst_window")]
    pub burst_window_secs: u64,

    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_max_interval_cv")]
    pub max_interval_cv: f64,

    #[serde(default = "default_retention")]
    pub penalty_secs: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            burst_window_secs: default_burst_window(),
            burst_threshold: default_burst_threshold(),
            min_samples: default_min_samples(),
            max_interval_cv: default_max_interval_cv(),
            penalty_secs: default_retention(),
        }
    }
}

fn default_burst_window() -> u64 {
    10
}

fn default_burst_threshold() -> u64 {
    50
}

fn default_min_samples() -> usize {
    10
}

fn default_max_interval_cv() -> f64 {
    0.05
}

/// Which shared store backs the distributed engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Local engine only
    #[default]
    None,
    Memory,
    Cluster,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Upper bound on each store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Redis connection URL, required by the `redis` backend
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::None,
            timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::Closed,
            key_prefix: default_key_prefix(),
            redis_url: None,
            cluster: ClusterSettings::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "ratewarden".to_string()
}

/// Gossip cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Unique node id; generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "ratewarden".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

impl ClusterSettings {
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn secs(value: f64, what: &str) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(WardenError::Config(format!("{} must be positive", what)));
    }
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| *d <= MAX_PERIOD)
        .ok_or_else(|| WardenError::Config(format!("{} must not exceed {:?}", what, MAX_PERIOD)))
}

fn whole_secs(value: u64, what: &str) -> Result<Duration> {
    let period = Duration::from_secs(value);
    if period > MAX_PERIOD {
        return Err(WardenError::Config(format!("{} must not exceed {:?}", what, MAX_PERIOD)));
    }
    Ok(period)
}

impl WardenConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        let config: WardenConfig = builder
            .add_source(config::Environment::with_prefix("RATEWARDEN").separator("__"))
            .build()?
            .try_deserialize()?;

        info!(path = ?path, limits = config.limits.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Check every rule and engine setting.
    pub fn validate(&self) -> Result<()> {
        self.registry()?;
        self.limiter_settings()?;
        if self.detector.enabled && self.distributed.backend != StoreBackend::None {
            return Err(WardenError::Config(
                "the detector needs the local engine and cannot be combined with a distributed backend"
                    .to_string(),
            ));
        }
        if self.distributed.backend == StoreBackend::Redis && self.distributed.redis_url.is_none() {
            return Err(WardenError::Config(
                "the redis backend needs distributed.redis_url".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the registry of configured limits.
    pub fn registry(&self) -> Result<RateLimitRegistry> {
        RateLimitRegistry::from_rules(&self.limits)
    }

    pub fn limiter_settings(&self) -> Result<LimiterSettings> {
        let backoff = BackoffPolicy::new(
            secs(self.backoff.base_secs, "backoff.base_secs")?,
            self.backoff.multiplier,
            secs(self.backoff.max_secs, "backoff.max_secs")?,
        )?;

        let detector = if self.detector.enabled {
            Some(DetectorConfig {
                burst_window: whole_secs(self.detector.burst_window_secs, "detector.burst_window_secs")?,
                burst_threshold: self.detector.burst_threshold,
                min_samples: self.detector.min_samples,
                max_interval_cv: self.detector.max_interval_cv,
                penalty: whole_secs(self.detector.penalty_secs, "detector.penalty_secs")?,
            })
        } else {
            None
        };

        Ok(LimiterSettings {
            backoff,
            escalate_during_backoff: self.backoff.escalate_during_backoff,
            user_tier: self.tiers.user.clone(),
            global_tier: self.tiers.global.clone(),
            violation_retention: Duration::from_secs(self.cleanup.violation_retention_secs),
            bucket_retention: Duration::from_secs(self.cleanup.bucket_retention_secs),
            detector,
        })
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs)
    }

    /// Build the local engine with every configured limit registered.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        Ok(RateLimiter::with_registry(
            self.limiter_settings()?,
            self.registry()?,
        ))
    }

    /// Build the distributed engine over `store`.
    pub fn build_distributed(
        &self,
        store: Arc<dyn DistributedStore>,
    ) -> Result<DistributedRateLimiter> {
        if self.detector.enabled {
            return Err(WardenError::Config(
                "the detector needs the local engine and cannot be combined with a distributed backend"
                    .to_string(),
            ));
        }
        let settings = DistributedSettings {
            limiter: self.limiter_settings()?,
            timeout: Duration::from_millis(self.distributed.timeout_ms),
            failure_policy: self.distributed.failure_policy,
            key_prefix: self.distributed.key_prefix.clone(),
        };
        Ok(DistributedRateLimiter::with_registry(
            store,
            settings,
            self.registry()?,
        ))
    }

    /// Connect the configured store, or `None` for the local engine.
    pub async fn connect_store(&self) -> Result<Option<Arc<dyn DistributedStore>>> {
        let store: Arc<dyn DistributedStore> = match self.distributed.backend {
            StoreBackend::None => return Ok(None),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Cluster => {
                Arc::new(ClusterStore::start(self.distributed.cluster.to_cluster_config()).await?)
            }
            StoreBackend::Redis => self.connect_redis().await?,
        };
        info!(backend = ?self.distributed.backend, "Distributed store connected");
        Ok(Some(store))
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(&self) -> Result<Arc<dyn DistributedStore>> {
        let url = self.distributed.redis_url.as_deref().ok_or_else(|| {
            WardenError::Config("the redis backend needs distributed.redis_url".to_string())
        })?;
        Ok(Arc::new(crate::store::RedisStore::connect(url).await?))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(&self) -> Result<Arc<dyn DistributedStore>> {
        Err(WardenError::Config(
            "the redis backend requires building with the `redis` feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Preset;

    const SAMPLE: &str = r#"
limits:
  - identifier: login
    preset: strict
  - identifier: search
    requests: 30
    unit: minute
    burst:
      capacity: 5
      refill_per_sec: 1.0
  - identifier: export
    requests: 2
    window_secs: 0.5
backoff:
  base_secs: 2
  max_secs: 60
distributed:
  backend: memory
  failure_policy: open
"#;

    #[test]
    fn test_default_config() {
        let config = WardenConfig::default();
        assert!(config.limits.is_empty());
        assert_eq!(config.backoff.multiplier, 2.0);
        assert!(config.backoff.escalate_during_backoff);
        assert_eq!(config.tiers.user, "user");
        assert_eq!(config.cleanup.interval_secs, 300);
        assert!(!config.detector.enabled);
        assert_eq!(config.distributed.backend, StoreBackend::None);
        assert_eq!(config.distributed.timeout_ms, 250);
        assert_eq!(config.distributed.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let config = WardenConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.limits.len(), 3);
        assert_eq!(config.limits[0].preset, Some(Preset::Strict));
        assert_eq!(config.distributed.backend, StoreBackend::Memory);
        assert_eq!(config.distributed.failure_policy, FailurePolicy::Open);
        config.validate().unwrap();

        let registry = config.registry().unwrap();
        assert_eq!(registry.get("login").unwrap().requests, 10);
        assert!(registry.get("search").unwrap().burst.is_some());
        assert_eq!(
            registry.get("export").unwrap().window,
            Duration::from_millis(500)
        );

        let settings = config.limiter_settings().unwrap();
        assert_eq!(settings.backoff.base, Duration::from_secs(2));
        assert_eq!(settings.backoff.max, Duration::from_secs(60));
        assert!(settings.detector.is_none());
    }

    #[tokio::test]
    async fn test_detector_requires_local_engine() {
        let local = WardenConfig::from_yaml("detector:\n  enabled: true\n  burst_threshold: 20\n").unwrap();
        local.validate().unwrap();
        assert_eq!(local.limiter_settings().unwrap().detector.unwrap().burst_threshold, 20);

        let shared = WardenConfig::from_yaml(
            "detector:\n  enabled: true\ndistributed:\n  backend: memory\n",
        )
        .unwrap();
        assert!(matches!(shared.validate(), Err(WardenError::Config(_))));

        let store = shared.connect_store().await.unwrap().unwrap();
        assert!(matches!(
            shared.build_distributed(store),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let config =
            WardenConfig::from_yaml("limits:\n  - identifier: bad\n    requests: 0\n    unit: second\n")
                .unwrap();
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));

        let config = WardenConfig::from_yaml("backoff:\n  base_secs: 0\n").unwrap();
        assert!(config.validate().is_err());

        let config = WardenConfig::from_yaml("distributed:\n  backend: redis\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        for yaml in [
            "backoff:\n  max_secs: 1.0e30\n",
            "backoff:\n  max_secs: 1.0e9\n",
            "limits:\n  - identifier: slow\n    requests: 1\n    window_secs: 1.0e30\n",
            "detector:\n  enabled: true\n  penalty_secs: 18446744073709551615\n",
        ] {
            let config = WardenConfig::from_yaml(yaml).unwrap();
            assert!(
                matches!(config.validate(), Err(WardenError::Config(_))),
                "expected a config error for {yaml:?}"
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, SAMPLE).unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limits.len(), 3);
        let limiter = config.build_limiter().unwrap();
        assert_eq!(limiter.rate_limit("search").unwrap().requests, 30);
    }

    #[test]
    fn test_cluster_settings_conversion() {
        let settings = ClusterSettings {
            node_id: Some("node-a".to_string()),
            ..Default::default()
        };
        let cluster = settings.to_cluster_config();
        assert_eq!(cluster.node_id, "node-a");
        assert_eq!(cluster.advertise_addr, settings.listen_addr);
        assert_eq!(cluster.gossip_interval, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let config = WardenConfig::from_yaml(SAMPLE).unwrap();
        let store = config.connect_store().await.unwrap().unwrap();
        let limiter = config.build_distributed(store).unwrap();

        let result = limiter.check_rate_limit("login", Some("u1")).await;
        assert!(result.allowed);
        assert_eq!(result.remaining_requests, 9);

        assert!(WardenConfig::default().connect_store().await.unwrap().is_none());
    }
}
