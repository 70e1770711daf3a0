//! In-process key/value store with per-entry TTL.
//!
//! Backs the two ephemeral stores the gateway needs: the idempotency cache
//! (24 h) and the provider OAuth token cache (provider-reported lifetime
//! minus a safety margin). Entries are evicted lazily on read and can be
//! swept periodically; both writers follow last-writer-wins, which is
//! acceptable for interchangeable tokens and for idempotency records whose
//! racing writers hold identical responses.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    deadline: Instant,
}

/// A concurrent map whose entries expire after a per-insert TTL.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store `value` under `key` for `ttl`. Replaces any previous entry.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a live entry, evicting it if its deadline has passed.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.deadline > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry. Called from a background sweep so the map
    /// does not accumulate tombstones for keys that are never read again.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.deadline > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_entries_are_returned() {
        let cache = TtlCache::new();
        cache.insert("k", 42u32, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(42));
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = TtlCache::new();
        cache.insert("k", 1u32, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_replaces_previous_value_and_ttl() {
        let cache = TtlCache::new();
        cache.insert("k", 1u32, Duration::from_millis(0));
        cache.insert("k", 2u32, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = TtlCache::new();
        cache.insert("dead", 1u32, Duration::from_millis(0));
        cache.insert("live", 2u32, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"live"), Some(2));
    }
}
