//! Bounded LRU cache with eviction telemetry.
//!
//! The backing structure is an [`IndexMap`] guarded by a single mutex:
//! insertion order doubles as recency order (front = coldest, back =
//! hottest). All operations are atomic with respect to each other — an
//! external observer never sees the size exceed capacity, and the stats
//! counters are consistent with the operations that produced them.

use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{SearchError, SearchResult};

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
}

/// A thread-safe, bounded, least-recently-used cache.
#[derive(Debug)]
pub struct LruCache<K, V> {
    map: Mutex<IndexMap<K, V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// # Errors
    /// Rejects `capacity == 0`: a zero-capacity LRU can satisfy no contract.
    pub fn new(capacity: usize) -> SearchResult<Self> {
        if capacity == 0 {
            return Err(SearchError::InvalidConfig(
                "LRU capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            map: Mutex::new(IndexMap::with_capacity(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up `key`, promoting the entry to most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Promote by remove + reinsert: IndexMap keeps insertion order, so
        // the reinserted entry lands at the back (hottest position).
        match map.shift_remove_entry(key) {
            Some((k, v)) => {
                let out = v.clone();
                map.insert(k, v);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(out)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Peek without promoting. Does not count as a hit or miss.
    pub fn peek(&self, key: &K) -> Option<V> {
        let map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(key).cloned()
    }

    /// Insert or replace `key`. Evicts the least-recently-used entry when the
    /// cache is full and `key` is new.
    pub fn put(&self, key: K, value: V) {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if map.shift_remove(&key).is_none() && map.len() >= self.capacity {
            // Front of the IndexMap is the coldest entry.
            if map.shift_remove_index(0).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        map.insert(key, value);
    }

    /// Remove `key` if present. Returns the removed value.
    pub fn delete(&self, key: &K) -> Option<V> {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.shift_remove(key)
    }

    /// Drop every entry. Stats counters are preserved.
    pub fn clear(&self) {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.clear();
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        let map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of hit/miss/eviction counters and current size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }

    /// Retain only entries for which `keep` returns true.
    ///
    /// Used by TTL sweepers; preserves recency order of the survivors.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.retain(|k, v| keep(k, v));
    }

    /// Clone out all entries, coldest first. Intended for tests and export.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(LruCache::<String, u32>::new(0).is_err());
    }

    #[test]
    fn put_get_delete_round_trip() {
        let cache = LruCache::new(4).unwrap();
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.delete(&"a"), Some(1));
        assert_eq!(cache.get(&"a"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn evicts_least_recently_used_on_put() {
        let cache = LruCache::new(2).unwrap();
        cache.put("a", 1);
        cache.put("b", 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3);
        assert_eq!(cache.peek(&"b"), None);
        assert_eq!(cache.peek(&"a"), Some(1));
        assert_eq!(cache.peek(&"c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let cache = LruCache::new(2).unwrap();
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.peek(&"a"), Some(10));
    }

    #[test]
    fn capacity_is_never_exceeded_under_concurrent_writes() {
        use std::sync::Arc;

        let cache = Arc::new(LruCache::new(16).unwrap());
        std::thread::scope(|s| {
            for t in 0..4 {
                let cache = Arc::clone(&cache);
                s.spawn(move || {
                    for i in 0..500 {
                        cache.put(format!("k{t}-{i}"), i);
                        assert!(cache.len() <= 16);
                        let _ = cache.get(&format!("k{t}-{}", i / 2));
                    }
                });
            }
        });
        assert!(cache.len() <= 16);
    }

    #[test]
    fn clear_preserves_counters() {
        let cache = LruCache::new(2).unwrap();
        cache.put("a", 1);
        let _ = cache.get(&"a");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
    }
}
