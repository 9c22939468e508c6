//! Hybrid query engine.
//!
//! Pipeline: embed query → retrieve candidates (vector ∥ keyword) →
//! per-stream min-max normalization → weighted fusion → optional
//! cross-encoder re-rank → optional MMR diversification → deterministic
//! final ordering (score descending, `chunk_id` ascending).
//!
//! Degradation: in hybrid mode a failing vector stream (backend down,
//! breaker open, embedder unavailable) downgrades the query to keyword-only
//! and flags the outcome `degraded`; in vector mode the same failures
//! surface as errors. The keyword stream is local and infallible.

use std::collections::HashMap;
use std::sync::Arc;

use knowledgebeast_core::{QueryMode, QueryResultItem};

use crate::chunk_store::ChunkStore;
use crate::embedder::Embedder;
use crate::embedding_cache::EmbeddingCache;
use crate::error::{SearchError, SearchResult};
use crate::fusion::{FusedCandidate, fuse, fused_cmp};
use crate::keyword::{KeywordHit, KeywordIndex};
use crate::mmr::{MmrCandidate, mmr_select};
use crate::vector::{ScoredChunk, VectorStoreAdapter};

/// Engine tuning parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Vector-stream weight in hybrid fusion, in `[0, 1]`.
    pub alpha: f32,
    /// Candidate over-fetch multiplier: `K = max(top_k * overfetch, top_k + 20)`.
    pub overfetch: usize,
    /// Maximum candidates handed to the re-ranker.
    pub rerank_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            overfetch: 3,
            rerank_window: 50,
        }
    }
}

/// The cross-encoder capability interface.
pub trait Reranker: Send + Sync {
    /// Score `passages` (pairs of `chunk_id`, text) against `query`.
    /// Returns one score per passage, in input order.
    ///
    /// # Errors
    /// Rerank failures are non-fatal to the query path; callers fall back to
    /// the fused ordering.
    fn rerank(&self, query: &str, passages: &[(String, String)]) -> SearchResult<Vec<f32>>;

    /// Model identifier, for logging.
    fn model_id(&self) -> &str;
}

/// Deterministic in-process re-ranker: scores a passage by the fraction of
/// query tokens it contains, weighted by inverse passage length. Stands in
/// for a real cross-encoder the way the hash embedder stands in for a real
/// embedding model.
#[derive(Debug, Clone)]
pub struct TokenOverlapReranker {
    id: String,
}

impl Default for TokenOverlapReranker {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenOverlapReranker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: "kb-token-overlap".to_string(),
        }
    }
}

impl Reranker for TokenOverlapReranker {
    #[allow(clippy::cast_precision_loss)]
    fn rerank(&self, query: &str, passages: &[(String, String)]) -> SearchResult<Vec<f32>> {
        let query_tokens = crate::keyword::tokenize(query);
        if query_tokens.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }
        Ok(passages
            .iter()
            .map(|(_, text)| {
                let passage_tokens = crate::keyword::tokenize(text);
                if passage_tokens.is_empty() {
                    return 0.0;
                }
                let overlap = query_tokens
                    .iter()
                    .filter(|q| passage_tokens.contains(q))
                    .count() as f32;
                let coverage = overlap / query_tokens.len() as f32;
                // Light length damping so terse exact matches edge out
                // sprawling passages that merely mention the terms.
                coverage / (1.0 + (passage_tokens.len() as f32).ln_1p() / 10.0)
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}

/// Borrowed view of one project's local indexes for the duration of a query.
#[derive(Clone, Copy)]
pub struct ProjectIndexes<'a> {
    pub project_id: &'a str,
    pub keyword: &'a KeywordIndex,
    pub chunks: &'a ChunkStore,
}

/// A fully-specified retrieval request.
#[derive(Debug, Clone)]
pub struct SearchSpec<'a> {
    pub query: &'a str,
    pub top_k: usize,
    pub mode: QueryMode,
    pub rerank: bool,
    pub mmr_lambda: Option<f32>,
    pub filter: Option<&'a HashMap<String, String>>,
}

/// Engine result: ranked items plus degradation flags.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub results: Vec<QueryResultItem>,
    pub degraded: bool,
    pub reranked: bool,
}

impl EngineOutcome {
    const fn empty() -> Self {
        Self {
            results: Vec::new(),
            degraded: false,
            reranked: false,
        }
    }
}

/// The hybrid query engine. One instance serves all projects; per-project
/// state is passed in per call via [`ProjectIndexes`].
pub struct HybridQueryEngine {
    embedder: Arc<dyn Embedder>,
    embeddings: Arc<EmbeddingCache>,
    vectors: Arc<VectorStoreAdapter>,
    reranker: Option<Arc<dyn Reranker>>,
    config: EngineConfig,
}

impl HybridQueryEngine {
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        embeddings: Arc<EmbeddingCache>,
        vectors: Arc<VectorStoreAdapter>,
        reranker: Option<Arc<dyn Reranker>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            embedder,
            embeddings,
            vectors,
            reranker,
            config,
        }
    }

    /// Embed a query through the shared cache. Used by the semantic query
    /// cache before deciding whether the full pipeline needs to run.
    ///
    /// # Errors
    /// [`SearchError::EmbeddingFailed`] when the embedder is unavailable.
    pub fn embed_query(&self, query: &str) -> SearchResult<Vec<f32>> {
        self.embeddings.get_or_embed(self.embedder.as_ref(), query)
    }

    /// Execute the full retrieval pipeline.
    ///
    /// # Errors
    /// Vector mode surfaces `BackendUnavailable` when the vector stream
    /// cannot serve; hybrid mode degrades instead. Keyword mode never fails.
    pub fn search(&self, indexes: ProjectIndexes<'_>, spec: &SearchSpec<'_>) -> SearchResult<EngineOutcome> {
        if spec.top_k == 0 || spec.query.trim().is_empty() {
            // An empty query embeds nothing and matches nothing; this is a
            // successful empty result, never an error.
            return Ok(EngineOutcome::empty());
        }

        let k = self.candidate_budget(spec.top_k);
        let (candidates, degraded) = match spec.mode {
            QueryMode::Keyword => {
                // Single-stream modes report the stream's own normalized
                // score; the fusion weight only applies to hybrid.
                let hits = indexes.keyword.search(spec.query, k);
                (fuse(&[], &hits, 0.0), false)
            }
            QueryMode::Vector => {
                let hits = self.vector_stream(indexes.project_id, spec, k)?;
                (fuse(&hits, &[], 1.0), false)
            }
            QueryMode::Hybrid => self.hybrid_streams(indexes, spec, k),
        };

        let mut candidates = self.apply_filter(indexes.chunks, candidates, spec.filter);
        let mut reranked = false;

        if spec.rerank && !candidates.is_empty() {
            reranked = self.apply_rerank(indexes.chunks, spec.query, &mut candidates);
        }

        if let Some(lambda) = spec.mmr_lambda {
            candidates = Self::apply_mmr(indexes.chunks, candidates, lambda, spec.top_k);
        }

        candidates.truncate(spec.top_k);
        let results = Self::assemble(indexes.chunks, &candidates);
        Ok(EngineOutcome {
            results,
            degraded,
            reranked,
        })
    }

    fn candidate_budget(&self, top_k: usize) -> usize {
        (top_k.saturating_mul(self.config.overfetch)).max(top_k + 20)
    }

    /// Run the vector stream: embed + backend query.
    fn vector_stream(
        &self,
        project_id: &str,
        spec: &SearchSpec<'_>,
        k: usize,
    ) -> SearchResult<Vec<ScoredChunk>> {
        let embedding = self
            .embed_query(spec.query)
            .map_err(|e| SearchError::BackendUnavailable(format!("query embedding: {e}")))?;
        self.vectors
            .query(project_id, &embedding, k, spec.filter)
    }

    /// Run both streams, vector in a scoped worker thread so the CPU-local
    /// BM25 scoring overlaps the backend round-trip.
    fn hybrid_streams(
        &self,
        indexes: ProjectIndexes<'_>,
        spec: &SearchSpec<'_>,
        k: usize,
    ) -> (Vec<FusedCandidate>, bool) {
        let (vector_out, keyword_hits) = std::thread::scope(|s| {
            let vector_task = s.spawn(|| self.vector_stream(indexes.project_id, spec, k));
            let keyword_hits: Vec<KeywordHit> = indexes.keyword.search(spec.query, k);
            let vector_out = vector_task
                .join()
                .unwrap_or_else(|_| Err(SearchError::Internal("vector stream panicked".into())));
            (vector_out, keyword_hits)
        });

        match vector_out {
            Ok(vector_hits) => (fuse(&vector_hits, &keyword_hits, self.config.alpha), false),
            Err(e) => {
                tracing::warn!(
                    project_id = indexes.project_id,
                    error = %e,
                    "vector stream unavailable; serving keyword-only results"
                );
                (fuse(&[], &keyword_hits, 0.0), true)
            }
        }
    }

    /// Drop candidates whose chunk metadata does not match the filter. The
    /// vector backend already filters server-side; this also covers the
    /// keyword stream and any backend that ignores filters.
    fn apply_filter(
        &self,
        chunks: &ChunkStore,
        candidates: Vec<FusedCandidate>,
        filter: Option<&HashMap<String, String>>,
    ) -> Vec<FusedCandidate> {
        let Some(filter) = filter else {
            return candidates;
        };
        if filter.is_empty() {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|c| {
                chunks
                    .get(&c.chunk_id)
                    .is_some_and(|chunk| metadata_matches(&chunk.metadata, filter))
            })
            .collect()
    }

    /// Replace fused scores with cross-encoder scores over the top window.
    /// Returns whether the re-rank was applied; failures fall back to the
    /// fused ordering.
    fn apply_rerank(
        &self,
        chunks: &ChunkStore,
        query: &str,
        candidates: &mut Vec<FusedCandidate>,
    ) -> bool {
        let Some(reranker) = self.reranker.as_ref() else {
            return false;
        };
        let window = candidates.len().min(self.config.rerank_window);
        let passages: Vec<(String, String)> = candidates[..window]
            .iter()
            .filter_map(|c| chunks.get(&c.chunk_id).map(|chunk| (c.chunk_id.clone(), chunk.text)))
            .collect();
        if passages.is_empty() {
            return false;
        }

        match reranker.rerank(query, &passages) {
            Ok(scores) if scores.len() == passages.len() => {
                let by_id: HashMap<&str, f32> = passages
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .zip(scores)
                    .collect();
                for candidate in candidates.iter_mut().take(window) {
                    if let Some(score) = by_id.get(candidate.chunk_id.as_str()) {
                        candidate.fused_score = *score;
                    }
                }
                candidates.sort_by(fused_cmp);
                knowledgebeast_core::global_metrics().query.reranked_total.inc();
                true
            }
            Ok(scores) => {
                tracing::warn!(
                    model = reranker.model_id(),
                    expected = passages.len(),
                    got = scores.len(),
                    "re-ranker returned mismatched score count; keeping fused order"
                );
                knowledgebeast_core::global_metrics()
                    .query
                    .rerank_failures_total
                    .inc();
                false
            }
            Err(e) => {
                tracing::warn!(
                    model = reranker.model_id(),
                    error = %e,
                    "re-ranker failed; keeping fused order"
                );
                knowledgebeast_core::global_metrics()
                    .query
                    .rerank_failures_total
                    .inc();
                false
            }
        }
    }

    /// Diversify via MMR using stored chunk vectors for the redundancy term.
    fn apply_mmr(
        chunks: &ChunkStore,
        candidates: Vec<FusedCandidate>,
        lambda: f32,
        top_k: usize,
    ) -> Vec<FusedCandidate> {
        let mmr_candidates: Vec<MmrCandidate> = candidates
            .iter()
            .map(|c| MmrCandidate {
                chunk_id: c.chunk_id.clone(),
                relevance: c.fused_score,
                vector: chunks.get(&c.chunk_id).and_then(|chunk| chunk.vector),
            })
            .collect();
        let order = mmr_select(&mmr_candidates, lambda, top_k);
        order.into_iter().map(|i| candidates[i].clone()).collect()
    }

    /// Materialize response items from the chunk store. Candidates whose
    /// chunks are gone (deleted since retrieval) are dropped, never served
    /// with stale text.
    fn assemble(chunks: &ChunkStore, candidates: &[FusedCandidate]) -> Vec<QueryResultItem> {
        candidates
            .iter()
            .filter_map(|c| {
                chunks.get(&c.chunk_id).map(|chunk| QueryResultItem {
                    chunk_id: c.chunk_id.clone(),
                    doc_id: chunk.doc_id,
                    text: chunk.text,
                    score: c.fused_score,
                    vector_score: c.vector_score,
                    keyword_score: c.keyword_score,
                    metadata: chunk.metadata,
                })
            })
            .collect()
    }
}

/// Exact-match metadata filtering: every filter pair must equal the chunk's
/// metadata value (scalars compared by string form).
fn metadata_matches(
    metadata: &HashMap<String, serde_json::Value>,
    filter: &HashMap<String, String>,
) -> bool {
    filter.iter().all(|(key, wanted)| {
        metadata.get(key).is_some_and(|value| match value {
            serde_json::Value::String(s) => s == wanted,
            other => other.to_string() == *wanted,
        })
    })
}
