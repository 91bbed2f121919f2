//! Sliding window request log.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::key::LimitKey;

/// One recorded request (or batch of requests) in a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    pub timestamp: Instant,
    pub count: u64,
}

/// Per-key ordered log of timestamped request entries.
///
/// Every count purges entries older than the window before counting, so the
/// memory held for a key is bounded by the requests it made in one window.
/// The store is not synchronized; the engine guards it with its own lock.
#[derive(Debug, Default)]
pub struct SlidingWindowStore {
    windows: HashMap<LimitKey, VecDeque<WindowEntry>>,
}

impl SlidingWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count requests for `key` with `timestamp >= now - window`.
    ///
    /// An unknown key counts as an empty history.
    pub fn count(&mut self, key: &LimitKey, window: Duration, now: Instant) -> u64 {
        match self.windows.get_mut(key) {
            Some(entries) => {
                purge(entries, window, now);
                entries.iter().map(|e| e.count).sum()
            }
            None => 0,
        }
    }

    /// Record `count` requests for `key` at `timestamp`.
    pub fn append(&mut self, key: &LimitKey, timestamp: Instant, count: u64) {
        let entries = self.windows.entry(key.clone()).or_default();
        let entry = WindowEntry { timestamp, count };

        // Keep the log ordered even if a caller supplies an older timestamp.
        match entries.back() {
            Some(last) if last.timestamp > timestamp => {
                let pos = entries.partition_point(|e| e.timestamp <= timestamp);
                entries.insert(pos, entry);
            }
            _ => entries.push_back(entry),
        }
    }

    /// Timestamp of the oldest entry still held for `key`.
    pub fn oldest(&self, key: &LimitKey) -> Option<Instant> {
        self.windows
            .get(key)
            .and_then(|entries| entries.front())
            .map(|e| e.timestamp)
    }

    /// Entries currently held for `key`, oldest first.
    pub fn entries(&self, key: &LimitKey) -> Option<&VecDeque<WindowEntry>> {
        self.windows.get(key)
    }

    pub fn remove(&mut self, key: &LimitKey) {
        self.windows.remove(key);
    }

    /// Remove every key whose identifier matches.
    pub fn remove_identifier(&mut self, identifier: &str) {
        self.windows.retain(|k, _| k.identifier != identifier);
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }

    /// Number of keys with at least one entry.
    pub fn active_windows(&self) -> usize {
        self.windows.values().filter(|e| !e.is_empty()).count()
    }

    /// Sum of all held request counts.
    pub fn total_requests(&self) -> u64 {
        self.windows
            .values()
            .flat_map(|entries| entries.iter())
            .map(|e| e.count)
            .sum()
    }

    /// Sum of request counts recorded within `span` of `now`.
    pub fn recent_requests(&self, span: Duration, now: Instant) -> u64 {
        let cutoff = now.checked_sub(span);
        self.windows
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .map(|e| e.count)
            .sum()
    }

    /// Purge every key against its own window and drop keys left empty.
    ///
    /// Keys for which `window_for` returns `None` are dropped entirely.
    /// Returns the number of keys removed.
    pub fn purge_expired<F>(&mut self, now: Instant, window_for: F) -> usize
    where
        F: Fn(&LimitKey) -> Option<Duration>,
    {
        let before = self.windows.len();
        self.windows.retain(|key, entries| match window_for(key) {
            Some(window) => {
                purge(entries, window, now);
                !entries.is_empty()
            }
            None => false,
        });
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

fn purge(entries: &mut VecDeque<WindowEntry>, window: Duration, now: Instant) {
    let Some(cutoff) = now.checked_sub(window) else {
        return;
    };
    while let Some(front) = entries.front() {
        if front.timestamp < cutoff {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LimitKey {
        LimitKey::shared("x")
    }

    #[test]
    fn test_unknown_key_counts_zero() {
        let mut store = SlidingWindowStore::new();
        assert_eq!(store.count(&key(), Duration::from_secs(60), Instant::now()), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_count_sums_entries_in_window() {
        let mut store = SlidingWindowStore::new();
        let t0 = Instant::now();
        store.append(&key(), t0, 1);
        store.append(&key(), t0 + Duration::from_secs(1), 3);

        assert_eq!(store.count(&key(), Duration::from_secs(60), t0 + Duration::from_secs(2)), 4);
    }

    #[test]
    fn test_count_purges_old_entries() {
        let mut store = SlidingWindowStore::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(10);
        store.append(&key(), t0, 1);
        store.append(&key(), t0 + Duration::from_secs(5), 1);

        // Boundary entry at exactly now - window still counts
        assert_eq!(store.count(&key(), window, t0 + Duration::from_secs(10)), 2);
        assert_eq!(store.count(&key(), window, t0 + Duration::from_secs(11)), 1);
        assert_eq!(store.entries(&key()).unwrap().len(), 1);
        assert_eq!(store.oldest(&key()), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_append_keeps_order() {
        let mut store = SlidingWindowStore::new();
        let t0 = Instant::now();
        store.append(&key(), t0 + Duration::from_secs(2), 1);
        store.append(&key(), t0, 1);

        assert_eq!(store.oldest(&key()), Some(t0));
    }

    #[test]
    fn test_purge_expired_drops_empty_keys() {
        let mut store = SlidingWindowStore::new();
        let t0 = Instant::now();
        let other = LimitKey::shared("y");
        store.append(&key(), t0, 1);
        store.append(&other, t0 + Duration::from_secs(30), 1);

        let removed = store.purge_expired(t0 + Duration::from_secs(40), |_| Some(Duration::from_secs(20)));

        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.entries(&key()).is_none());

        assert_eq!(store.purge_expired(t0, |_| None), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_statistics_helpers() {
        let mut store = SlidingWindowStore::new();
        let t0 = Instant::now();
        store.append(&key(), t0, 2);
        store.append(&LimitKey::new("x", Some("u")), t0 + Duration::from_secs(50), 1);

        let now = t0 + Duration::from_secs(60);
        assert_eq!(store.active_windows(), 2);
        assert_eq!(store.total_requests(), 3);
        assert_eq!(store.recent_requests(Duration::from_secs(30), now), 1);

        store.remove_identifier("x");
        assert!(store.is_empty());
    }
}
