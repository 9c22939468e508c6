//! Semantic query cache.
//!
//! A nearest-query cache keyed by query embedding: a lookup hits when a
//! cached entry's embedding is within `hit_threshold` cosine similarity of
//! the incoming query, the entry's TTL has not expired, its mode matches,
//! and it was computed with at least the requested `top_k` (the cached
//! result is truncated down, never padded).
//!
//! One instance per project — cached results contain project data, so
//! sharing across tenants would be an isolation leak. Entries are inserted
//! with the *final* (post-MMR) result set and age out via TTL; ingest does
//! not clear the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use knowledgebeast_core::{QueryMode, QueryResultItem};

use crate::embedder::cosine_similarity;
use crate::error::SearchResult;
use crate::lru::{CacheStats, LruCache};

/// Tuning for the semantic cache.
#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    pub capacity: usize,
    /// Cosine similarity required for a hit, in `[0, 1]`.
    pub hit_threshold: f32,
    pub ttl: Duration,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            hit_threshold: 0.95,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedQuery {
    embedding: Vec<f32>,
    mode: QueryMode,
    top_k: usize,
    expires_at: Instant,
    results: Vec<QueryResultItem>,
}

/// Per-project semantic query cache.
pub struct SemanticQueryCache {
    entries: LruCache<u64, CachedQuery>,
    config: SemanticCacheConfig,
    next_id: AtomicU64,
}

impl SemanticQueryCache {
    /// # Errors
    /// Rejects a zero capacity.
    pub fn new(config: SemanticCacheConfig) -> SearchResult<Self> {
        Ok(Self {
            entries: LruCache::new(config.capacity)?,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Look up the nearest cached query. On a hit the entry is promoted and
    /// its results are returned truncated to `top_k`.
    #[must_use]
    pub fn lookup(
        &self,
        embedding: &[f32],
        mode: QueryMode,
        top_k: usize,
    ) -> Option<Vec<QueryResultItem>> {
        let metrics = knowledgebeast_core::global_metrics();
        let now = Instant::now();

        // Scan for the best-matching live entry. Capacity is small (default
        // 100), so a linear scan is cheaper than any index would be.
        let mut best: Option<(u64, f32)> = None;
        for (id, entry) in self.entries.entries() {
            if entry.mode != mode || entry.top_k < top_k || entry.expires_at <= now {
                continue;
            }
            let similarity = cosine_similarity(embedding, &entry.embedding);
            if similarity < self.config.hit_threshold {
                continue;
            }
            if best.is_none_or(|(_, s)| similarity > s) {
                best = Some((id, similarity));
            }
        }

        match best {
            Some((id, _)) => {
                // Promote via get(); entry may have been evicted between the
                // scan and now, in which case this is a miss after all.
                self.entries.get(&id).map_or_else(
                    || {
                        metrics.cache.semantic_misses_total.inc();
                        None
                    },
                    |entry| {
                        metrics.cache.semantic_hits_total.inc();
                        let mut results = entry.results;
                        results.truncate(top_k);
                        Some(results)
                    },
                )
            }
            None => {
                metrics.cache.semantic_misses_total.inc();
                None
            }
        }
    }

    /// Insert the final result set for a query.
    pub fn insert(
        &self,
        embedding: Vec<f32>,
        mode: QueryMode,
        top_k: usize,
        results: Vec<QueryResultItem>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.put(
            id,
            CachedQuery {
                embedding,
                mode,
                top_k,
                expires_at: Instant::now() + self.config.ttl,
                results,
            },
        );
    }

    /// Drop expired entries. Called by the background sweeper.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Drop everything (project delete).
    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(chunk_id: &str) -> QueryResultItem {
        QueryResultItem {
            chunk_id: chunk_id.to_string(),
            doc_id: "doc".to_string(),
            text: "text".to_string(),
            score: 1.0,
            vector_score: None,
            keyword_score: None,
            metadata: std::collections::HashMap::new(),
        }
    }

    fn cache(threshold: f32, ttl: Duration) -> SemanticQueryCache {
        SemanticQueryCache::new(SemanticCacheConfig {
            capacity: 8,
            hit_threshold: threshold,
            ttl,
        })
        .unwrap()
    }

    #[test]
    fn exact_embedding_hits_and_truncates() {
        let cache = cache(0.95, Duration::from_secs(60));
        cache.insert(
            vec![1.0, 0.0],
            QueryMode::Hybrid,
            10,
            vec![item("a"), item("b"), item("c")],
        );
        let hit = cache.lookup(&[1.0, 0.0], QueryMode::Hybrid, 2).unwrap();
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].chunk_id, "a");
    }

    #[test]
    fn near_but_below_threshold_misses() {
        let cache = cache(0.99, Duration::from_secs(60));
        cache.insert(vec![1.0, 0.0], QueryMode::Hybrid, 5, vec![item("a")]);
        // ~0.95 cosine: below the 0.99 bar.
        assert!(cache.lookup(&[1.0, 0.33], QueryMode::Hybrid, 5).is_none());
    }

    #[test]
    fn mode_mismatch_misses() {
        let cache = cache(0.9, Duration::from_secs(60));
        cache.insert(vec![1.0, 0.0], QueryMode::Hybrid, 5, vec![item("a")]);
        assert!(cache.lookup(&[1.0, 0.0], QueryMode::Keyword, 5).is_none());
    }

    #[test]
    fn smaller_cached_top_k_cannot_serve_larger_request() {
        let cache = cache(0.9, Duration::from_secs(60));
        cache.insert(vec![1.0, 0.0], QueryMode::Hybrid, 3, vec![item("a")]);
        assert!(cache.lookup(&[1.0, 0.0], QueryMode::Hybrid, 5).is_none());
        assert!(cache.lookup(&[1.0, 0.0], QueryMode::Hybrid, 3).is_some());
    }

    #[test]
    fn expired_entries_miss_and_sweep_removes_them() {
        let cache = cache(0.9, Duration::from_millis(10));
        cache.insert(vec![1.0, 0.0], QueryMode::Hybrid, 5, vec![item("a")]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.lookup(&[1.0, 0.0], QueryMode::Hybrid, 5).is_none());
        cache.sweep_expired();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = cache(0.9, Duration::from_secs(60));
        cache.insert(vec![1.0, 0.0], QueryMode::Hybrid, 5, vec![item("a")]);
        cache.clear();
        assert!(cache.lookup(&[1.0, 0.0], QueryMode::Hybrid, 5).is_none());
        assert_eq!(cache.stats().size, 0);
    }
}
