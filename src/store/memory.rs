//! In-process store.
//!
//! Uses DashMap for concurrent access. Suitable for a single instance, for
//! tests, and as the reference behaviour for the networked stores.
//!
//! Expired keys are dropped lazily on read and swept every `sweep_every`
//! writes, so keys that are never read again do not accumulate.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::DistributedStore;
use crate::error::{Result, WardenError};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Counter(u64),
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: Value, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            expires_at: if ttl.is_zero() { None } else { now.checked_add(ttl) },
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Writes between two sweeps of expired keys.
const DEFAULT_SWEEP_EVERY: u64 = 1024;

/// In-memory [`DistributedStore`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    writes: AtomicU64,
    sweep_every: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_every(DEFAULT_SWEEP_EVERY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that sweeps expired keys every `writes` writes.
    pub fn with_sweep_every(writes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
            sweep_every: writes.max(1),
        }
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired keys. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Count one write and sweep when the interval is reached. Must not be
    /// called while holding a map guard.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_every == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                debug!(removed = removed, "Swept expired keys from memory store");
            }
        }
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let Some(stored) = self.entries.get(key) else {
            return Ok(None);
        };
        if stored.is_expired(now) {
            drop(stored);
            self.entries.remove_if(key, |_, v| v.is_expired(now));
            return Ok(None);
        }
        match &stored.value {
            Value::Bytes(bytes) => Ok(Some(bytes.clone())),
            Value::Counter(count) => Ok(Some(count.to_string().into_bytes())),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        trace!(key = %key, ttl = ?ttl, "Memory store set");
        self.entries.insert(
            key.to_string(),
            StoredValue::new(Value::Bytes(value.to_vec()), ttl, Instant::now()),
        );
        self.note_write();
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let fresh = || StoredValue::new(Value::Counter(1), ttl, now);

        let count = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                if stored.is_expired(now) {
                    *stored = fresh();
                    1
                } else if let Value::Counter(count) = &mut stored.value {
                    *count += 1;
                    *count
                } else {
                    return Err(WardenError::store(
                        "increment",
                        key,
                        "value is not a counter",
                    ));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                1
            }
        };

        self.note_write();
        trace!(key = %key, count = count, "Memory store increment");
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
