//! Gossip-backed store using Chitchat.
//!
//! Every node publishes its own contribution to each counter in its chitchat
//! node state; a counter's value is the sum over all live nodes. Plain values
//! are published the same way and the most recently written copy wins.
//! State converges at gossip speed, so counts are eventually consistent
//! across nodes.

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::DistributedStore;
use crate::error::{Result, WardenError};

const COUNTER_PREFIX: &str = "counter|";
const VALUE_PREFIX: &str = "kv|";

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "ratewarden".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// One node's share of a counter: the window it was counted in and its count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterShare {
    window: i64,
    count: u64,
}

impl CounterShare {
    fn parse(value: &str) -> Option<Self> {
        let (window, count) = value.split_once(':')?;
        Some(Self {
            window: window.parse().ok()?,
            count: count.parse().ok()?,
        })
    }

    fn encode(&self) -> String {
        format!("{}:{}", self.window, self.count)
    }
}

/// A published plain value. A `None` value is a deletion marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PublishedValue {
    value: Option<Vec<u8>>,
    written_at_ms: i64,
    expires_at_ms: Option<i64>,
}

impl PublishedValue {
    fn is_live(&self, now_ms: i64) -> bool {
        self.value.is_some() && self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// Window number a counter with the given TTL falls in at `now_ms`.
fn window_of(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = ttl.as_millis() as i64;
    if ttl_ms <= 0 {
        0
    } else {
        now_ms.div_euclid(ttl_ms)
    }
}

/// [`DistributedStore`] that shares state over a chitchat gossip cluster.
///
/// Counters are fixed windows aligned to multiples of their TTL. A delete
/// clears this node's share of a counter at once; shares published by other
/// nodes stop counting when their window rolls over.
pub struct ClusterStore {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl ClusterStore {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| WardenError::store("start", config.node_id.as_str(), e))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| WardenError::store("shutdown", self.node_id.as_str(), format!("{:?}", e)))
    }

    /// Sum every live node's share of `chitchat_key` counted in `window`.
    fn sum_shares(chitchat: &chitchat::Chitchat, chitchat_key: &str, window: i64) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(chitchat_key).and_then(CounterShare::parse))
            .filter(|share| share.window == window)
            .map(|share| share.count)
            .sum()
    }

    /// The most recently written copy of a value across live nodes.
    fn latest_value(chitchat: &chitchat::Chitchat, chitchat_key: &str) -> Option<PublishedValue> {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(chitchat_key))
            .filter_map(|raw| serde_json::from_str::<PublishedValue>(raw).ok())
            .max_by_key(|published| published.written_at_ms)
    }

    async fn publish_value(&self, key: &str, published: PublishedValue) -> Result<()> {
        let encoded =
            serde_json::to_string(&published).map_err(|e| WardenError::store("set", key, e))?;
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat
            .self_node_state()
            .set(format!("{}{}", VALUE_PREFIX, key), encoded);
        Ok(())
    }
}

#[async_trait]
impl DistributedStore for ClusterStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        Ok(Self::latest_value(&chitchat, &format!("{}{}", VALUE_PREFIX, key))
            .filter(|published| published.is_live(now_ms))
            .and_then(|published| published.value))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let published = PublishedValue {
            value: Some(value.to_vec()),
            written_at_ms: now_ms,
            expires_at_ms: (!ttl.is_zero())
                .then(|| now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))),
        };
        self.publish_value(key, published).await
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let chitchat_key = format!("{}{}", COUNTER_PREFIX, key);
        let window = window_of(Utc::now().timestamp_millis(), ttl);

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(CounterShare::parse)
            .filter(|share| share.window == window)
            .map_or(0, |share| share.count);

        let share = CounterShare {
            window,
            count: current + 1,
        };
        chitchat.self_node_state().set(&chitchat_key, share.encode());

        debug!(key = %chitchat_key, local_value = share.count, "Incremented local counter share");

        Ok(Self::sum_shares(&chitchat, &chitchat_key, window))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        {
            let chitchat_arc = self.handle.chitchat();
            let mut chitchat = chitchat_arc.lock().await;
            let cleared = CounterShare { window: -1, count: 0 };
            chitchat
                .self_node_state()
                .set(format!("{}{}", COUNTER_PREFIX, key), cleared.encode());
        }

        let marker = PublishedValue {
            value: None,
            written_at_ms: Utc::now().timestamp_millis(),
            expires_at_ms: None,
        };
        self.publish_value(key, marker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_counter_share_encoding() {
        let share = CounterShare { window: 28_400_000, count: 7 };
        assert_eq!(share.encode(), "28400000:7");
        assert_eq!(CounterShare::parse("28400000:7"), Some(share));
        assert_eq!(CounterShare::parse("-1:0"), Some(CounterShare { window: -1, count: 0 }));
        assert!(CounterShare::parse("garbage").is_none());
        assert!(CounterShare::parse("1:x").is_none());
    }

    #[test]
    fn test_window_alignment() {
        let ttl = Duration::from_secs(60);
        assert_eq!(window_of(0, ttl), 0);
        assert_eq!(window_of(59_999, ttl), 0);
        assert_eq!(window_of(60_000, ttl), 1);
        assert_eq!(window_of(123_456, Duration::ZERO), 0);
    }

    #[test]
    fn test_published_value_liveness() {
        let live = PublishedValue {
            value: Some(b"v".to_vec()),
            written_at_ms: 0,
            expires_at_ms: Some(100),
        };
        assert!(live.is_live(99));
        assert!(!live.is_live(100));

        let deleted = PublishedValue {
            value: None,
            written_at_ms: 0,
            expires_at_ms: None,
        };
        assert!(!deleted.is_live(0));
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let store = ClusterStore::start(test_config(17946)).await.unwrap();

        assert_eq!(store.node_id(), "test-node-17946");
        assert_eq!(store.live_node_count().await, 1);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_store_operations() {
        let store = ClusterStore::start(test_config(17947)).await.unwrap();
        let ttl = Duration::from_secs(3600);

        assert_eq!(store.increment("user:u1", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("user:u1", ttl).await.unwrap(), 2);

        store.set("penalty", b"boxed", ttl).await.unwrap();
        assert_eq!(store.get("penalty").await.unwrap(), Some(b"boxed".to_vec()));

        store.delete("penalty").await.unwrap();
        store.delete("user:u1").await.unwrap();
        assert_eq!(store.get("penalty").await.unwrap(), None);
        assert_eq!(store.increment("user:u1", ttl).await.unwrap(), 1);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes_share_counters() {
        let store1 = ClusterStore::start(test_config(17948)).await.unwrap();

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let store2 = ClusterStore::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store1.live_node_count().await, 2);
        assert_eq!(store2.live_node_count().await, 2);

        let ttl = Duration::from_secs(3600);
        store1.increment("shared", ttl).await.unwrap();
        store1.increment("shared", ttl).await.unwrap();

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store2.increment("shared", ttl).await.unwrap(), 3);

        store1.shutdown().await.unwrap();
        store2.shutdown().await.unwrap();
    }
}
