//! Vector store adapter and the in-process backend.
//!
//! The vector backend is an external collaborator reached through the
//! [`VectorBackend`] capability trait. [`MemoryVectorBackend`] is the
//! in-process implementation: exact cosine top-k with deterministic
//! tie-breaking, one collection per project.
//!
//! [`VectorStoreAdapter`] wraps any backend with the reliability stack —
//! retry outside, circuit breaker inside, so breaker decisions see every
//! individual attempt — and caches collection initialization per project so
//! the create handshake runs once.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::embedder::{dot_product, normalize_l2};
use crate::error::{SearchError, SearchResult};
use crate::retry::RetryPolicy;

/// A vector plus identity and filterable metadata, as stored in a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub doc_id: String,
    pub vector: Vec<f32>,
    /// Flat string metadata used for equality filtering at query time.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A scored hit from a vector query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub doc_id: String,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Score descending, then `chunk_id` ascending.
fn scored_chunk_cmp(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    match b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal) {
        Ordering::Equal => a.chunk_id.cmp(&b.chunk_id),
        ord => ord,
    }
}

/// The opaque collection-store contract.
///
/// All operations are idempotent: `upsert` replaces by `chunk_id`, deletes
/// of absent ids succeed, `create_collection` of an existing collection is a
/// no-op. This is what makes the retry wrapper safe.
pub trait VectorBackend: Send + Sync {
    /// Create `collection` if it does not exist.
    ///
    /// # Errors
    /// Returns `BackendUnavailable` on transport failure.
    fn create_collection(&self, collection: &str) -> SearchResult<()>;

    /// Drop `collection` and all its records. Absent collections succeed.
    ///
    /// # Errors
    /// Returns `BackendUnavailable` on transport failure.
    fn delete_collection(&self, collection: &str) -> SearchResult<()>;

    /// Insert or replace records by `chunk_id`.
    ///
    /// # Errors
    /// `CollectionNotFound` when the collection was never created.
    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> SearchResult<()>;

    /// Exact top-`k` by cosine similarity, optionally filtered by metadata
    /// equality.
    ///
    /// # Errors
    /// `CollectionNotFound` when the collection was never created.
    fn query_by_vector(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> SearchResult<Vec<ScoredChunk>>;

    /// Remove every record whose `doc_id` matches.
    ///
    /// # Errors
    /// `CollectionNotFound` when the collection was never created.
    fn delete_by_doc(&self, collection: &str, doc_id: &str) -> SearchResult<()>;

    /// Number of records in the collection.
    ///
    /// # Errors
    /// `CollectionNotFound` when the collection was never created.
    fn count(&self, collection: &str) -> SearchResult<usize>;

    /// Cheap liveness probe.
    ///
    /// # Errors
    /// Returns `BackendUnavailable` when the backend is unreachable.
    fn ping(&self) -> SearchResult<()>;
}

// ────────────────────────────────────────────────────────────────────
// In-memory backend
// ────────────────────────────────────────────────────────────────────

/// Exact-search in-process backend.
///
/// Vectors are L2-normalized at insert so queries reduce to a dot product.
/// The `set_unavailable` killswitch makes every call fail with
/// `BackendUnavailable`, which is how operators (and the test suites) force
/// the degraded path without tearing the process down.
#[derive(Debug, Default)]
pub struct MemoryVectorBackend {
    collections: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
    unavailable: AtomicBool,
}

impl MemoryVectorBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator killswitch: force all calls to fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    fn check_available(&self) -> SearchResult<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(SearchError::BackendUnavailable(
                "vector backend disabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl VectorBackend for MemoryVectorBackend {
    fn create_collection(&self, collection: &str) -> SearchResult<()> {
        self.check_available()?;
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    fn delete_collection(&self, collection: &str) -> SearchResult<()> {
        self.check_available()?;
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        collections.remove(collection);
        Ok(())
    }

    fn upsert(&self, collection: &str, records: &[VectorRecord]) -> SearchResult<()> {
        self.check_available()?;
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let store = collections
            .get_mut(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;
        for record in records {
            let mut normalized = record.clone();
            normalized.vector = normalize_l2(&record.vector);
            store.insert(record.chunk_id.clone(), normalized);
        }
        Ok(())
    }

    fn query_by_vector(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> SearchResult<Vec<ScoredChunk>> {
        self.check_available()?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let collections = self
            .collections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let store = collections
            .get(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;

        let query = normalize_l2(vector);
        let mut hits: Vec<ScoredChunk> = store
            .values()
            .filter(|record| {
                filter.is_none_or(|wanted| {
                    wanted
                        .iter()
                        .all(|(key, value)| record.metadata.get(key) == Some(value))
                })
            })
            .map(|record| ScoredChunk {
                chunk_id: record.chunk_id.clone(),
                doc_id: record.doc_id.clone(),
                // Normalized at insert, so dot product is cosine similarity.
                score: dot_product(&query, &record.vector),
            })
            .collect();
        hits.sort_by(scored_chunk_cmp);
        hits.truncate(k);
        Ok(hits)
    }

    fn delete_by_doc(&self, collection: &str, doc_id: &str) -> SearchResult<()> {
        self.check_available()?;
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let store = collections
            .get_mut(collection)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))?;
        store.retain(|_, record| record.doc_id != doc_id);
        Ok(())
    }

    fn count(&self, collection: &str) -> SearchResult<usize> {
        self.check_available()?;
        let collections = self
            .collections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        collections
            .get(collection)
            .map(HashMap::len)
            .ok_or_else(|| SearchError::CollectionNotFound(collection.to_string()))
    }

    fn ping(&self) -> SearchResult<()> {
        self.check_available()
    }
}

// ────────────────────────────────────────────────────────────────────
// Adapter
// ────────────────────────────────────────────────────────────────────

/// Per-project collection lifecycle plus the reliability stack.
pub struct VectorStoreAdapter {
    backend: Arc<dyn VectorBackend>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    /// Collections known to exist; guards the lazy create handshake.
    initialized: Mutex<HashSet<String>>,
}

impl VectorStoreAdapter {
    #[must_use]
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        breaker_config: BreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(breaker_config),
            retry,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    /// Collection name for a project. One collection per project is the
    /// isolation boundary on the backend side.
    #[must_use]
    pub fn collection_name(project_id: &str) -> String {
        format!("kb_{project_id}")
    }

    /// Current breaker state (for health reporting).
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Force the breaker closed (operator action).
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    /// One guarded, retried backend attempt stream.
    fn call<T>(&self, op: impl Fn() -> SearchResult<T>) -> SearchResult<T> {
        let metrics = knowledgebeast_core::global_metrics();
        self.retry.execute(
            || {
                self.breaker.check()?;
                metrics.backend.calls_total.inc();
                match op() {
                    Ok(v) => {
                        self.breaker.on_success();
                        Ok(v)
                    }
                    Err(e) => {
                        metrics.backend.failures_total.inc();
                        // Contract violations are the caller's fault, not
                        // backend weather; they must not trip the breaker.
                        if !matches!(e, SearchError::CollectionNotFound(_)) {
                            self.breaker.on_failure();
                        }
                        Err(e)
                    }
                }
            },
            SearchError::is_retryable,
        )
    }

    /// Ensure the project's collection exists. The handshake runs once per
    /// process per project; later calls hit the cache.
    ///
    /// # Errors
    /// `BackendUnavailable` / `CircuitOpen` when the backend cannot be
    /// reached to create the collection.
    pub fn ensure_collection(&self, project_id: &str) -> SearchResult<()> {
        let name = Self::collection_name(project_id);
        {
            let initialized = self
                .initialized
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if initialized.contains(&name) {
                return Ok(());
            }
        }
        self.call(|| self.backend.create_collection(&name))?;
        let mut initialized = self
            .initialized
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        initialized.insert(name);
        Ok(())
    }

    /// Upsert records into the project's collection.
    ///
    /// # Errors
    /// Reliability-stack errors (`BackendUnavailable`, `CircuitOpen`) after
    /// retries are exhausted.
    pub fn upsert(&self, project_id: &str, records: &[VectorRecord]) -> SearchResult<()> {
        self.ensure_collection(project_id)?;
        let name = Self::collection_name(project_id);
        self.call(|| self.backend.upsert(&name, records))
    }

    /// Query the project's collection.
    ///
    /// A breaker rejection surfaces as `BackendUnavailable` here: on the
    /// query path callers only care that the vector stream cannot serve, not
    /// which layer refused it.
    ///
    /// # Errors
    /// `BackendUnavailable` when the backend or breaker refuses the call.
    pub fn query(
        &self,
        project_id: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> SearchResult<Vec<ScoredChunk>> {
        self.ensure_collection(project_id)
            .and_then(|()| {
                let name = Self::collection_name(project_id);
                self.call(|| self.backend.query_by_vector(&name, vector, k, filter))
            })
            .map_err(|e| match e {
                SearchError::CircuitOpen(msg) => SearchError::BackendUnavailable(msg),
                other => other,
            })
    }

    /// Remove all vectors belonging to `doc_id`.
    ///
    /// # Errors
    /// Reliability-stack errors after retries are exhausted.
    pub fn delete_by_doc(&self, project_id: &str, doc_id: &str) -> SearchResult<()> {
        self.ensure_collection(project_id)?;
        let name = Self::collection_name(project_id);
        self.call(|| self.backend.delete_by_doc(&name, doc_id))
    }

    /// Drop the project's collection entirely (project delete).
    ///
    /// # Errors
    /// Reliability-stack errors after retries are exhausted.
    pub fn delete_collection(&self, project_id: &str) -> SearchResult<()> {
        let name = Self::collection_name(project_id);
        self.call(|| self.backend.delete_collection(&name))?;
        let mut initialized = self
            .initialized
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        initialized.remove(&name);
        Ok(())
    }

    /// Record count for the project's collection.
    ///
    /// # Errors
    /// Reliability-stack errors after retries are exhausted.
    pub fn count(&self, project_id: &str) -> SearchResult<usize> {
        self.ensure_collection(project_id)?;
        let name = Self::collection_name(project_id);
        self.call(|| self.backend.count(&name))
    }

    /// Liveness probe through the reliability stack (single attempt — a
    /// health check must not spend the retry budget).
    ///
    /// # Errors
    /// `BackendUnavailable` / `CircuitOpen` when the backend is down.
    pub fn ping(&self) -> SearchResult<()> {
        self.breaker.check()?;
        match self.backend.ping() {
            Ok(()) => {
                self.breaker.on_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.on_failure();
                Err(e)
            }
        }
    }
}
