//! Retrieval machinery for KnowledgeBeast.
//!
//! Everything between "a query string arrives" and "ranked passages leave":
//!
//! - [`lru`] — bounded LRU cache with eviction telemetry
//! - [`embedder`] — embedding capability trait + hash-projection fallback
//! - [`embedding_cache`] — shared single-flight embedding cache
//! - [`breaker`] / [`retry`] — reliability wrappers for the vector backend
//! - [`chunker`] — recursive and semantic document splitting
//! - [`keyword`] — per-project BM25 inverted index with snapshot publishing
//! - [`vector`] — vector backend trait, in-memory backend, guarded adapter
//! - [`chunk_store`] — per-project authoritative chunk storage
//! - [`fusion`] / [`mmr`] — score fusion and diversification
//! - [`semantic_cache`] — nearest-query result cache
//! - [`engine`] — the hybrid query pipeline tying it all together
//!
//! Components here are synchronous and thread-safe; async boundaries live in
//! the server and db crates.

#![forbid(unsafe_code)]

pub mod breaker;
pub mod chunk_store;
pub mod chunker;
pub mod embedder;
pub mod embedding_cache;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod keyword;
pub mod lru;
pub mod mmr;
pub mod retry;
pub mod semantic_cache;
pub mod vector;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use chunk_store::ChunkStore;
pub use chunker::{ChunkPiece, ChunkStrategy, Chunker, ChunkerConfig};
pub use embedder::{Embedder, EmbeddingVec, HashEmbedder, ModelInfo, cosine_similarity};
pub use embedding_cache::EmbeddingCache;
pub use engine::{
    EngineConfig, EngineOutcome, HybridQueryEngine, ProjectIndexes, Reranker, SearchSpec,
    TokenOverlapReranker,
};
pub use error::{SearchError, SearchResult};
pub use fusion::{FusedCandidate, fuse, min_max_normalize};
pub use keyword::{Bm25Params, KeywordHit, KeywordIndex};
pub use lru::{CacheStats, LruCache};
pub use mmr::{MmrCandidate, mmr_select};
pub use retry::RetryPolicy;
pub use semantic_cache::{SemanticCacheConfig, SemanticQueryCache};
pub use vector::{MemoryVectorBackend, ScoredChunk, VectorBackend, VectorRecord, VectorStoreAdapter};
