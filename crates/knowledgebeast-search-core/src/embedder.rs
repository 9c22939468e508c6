//! Embedding provider abstraction and vector math helpers.
//!
//! The embedding model itself is an external collaborator; this module
//! defines the [`Embedder`] capability interface plus the deterministic
//! hash-projection fallback used when no real model is configured. The
//! fallback maps each token into a dimension slot by hash, so lexically
//! similar texts land near each other in cosine space — enough for the
//! semantic chunker, the semantic query cache, and tests to behave
//! meaningfully without a model download.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::{SearchError, SearchResult};

/// A dense embedding vector.
pub type EmbeddingVec = Vec<f32>;

/// Dimension of the hash-projection fallback embedder.
pub const HASH_EMBEDDER_DIM: usize = 64;

// ────────────────────────────────────────────────────────────────────
// Text normalization + hashing
// ────────────────────────────────────────────────────────────────────

/// Normalize text for hashing and embedding-cache keying: NFKC, lowercase,
/// whitespace collapsed to single spaces, trimmed.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    let mut out = String::with_capacity(folded.len());
    let mut last_was_space = true;
    for ch in folded.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// SHA-256 of the normalized text, hex-encoded.
#[must_use]
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

// ────────────────────────────────────────────────────────────────────
// Vector math
// ────────────────────────────────────────────────────────────────────

/// L2-normalize a vector. The zero vector is returned unchanged.
#[must_use]
pub fn normalize_l2(v: &[f32]) -> EmbeddingVec {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq <= f32::EPSILON {
        return v.to_vec();
    }
    let inv = norm_sq.sqrt().recip();
    v.iter().map(|x| x * inv).collect()
}

/// Dot product. Mismatched lengths contribute only over the shared prefix.
#[inline]
#[must_use]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1, 1]`; zero vectors yield 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot_product(a, b) / (na * nb)
}

// ────────────────────────────────────────────────────────────────────
// Embedder trait
// ────────────────────────────────────────────────────────────────────

/// Describes an embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Unique identifier (e.g. "all-minilm-l6-v2", "kb-hash-64").
    pub id: String,
    /// Embedding dimension.
    pub dimension: usize,
    /// Whether the model is loaded and ready.
    pub available: bool,
}

/// The embedding capability interface.
///
/// Implementations must be deterministic for a fixed model: the same text
/// always embeds to the same vector.
pub trait Embedder: Send + Sync {
    /// Embed a single text into a vector.
    ///
    /// # Errors
    /// Returns [`SearchError::EmbeddingFailed`] when the model is
    /// unavailable or the call fails.
    fn embed(&self, text: &str) -> SearchResult<EmbeddingVec>;

    /// Embed multiple texts. The default implementation loops over `embed`;
    /// batching backends override this.
    ///
    /// # Errors
    /// Returns `SearchError` if any embedding fails.
    fn embed_batch(&self, texts: &[&str]) -> SearchResult<Vec<EmbeddingVec>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Model metadata.
    fn model_info(&self) -> &ModelInfo;

    /// Whether the embedder can currently serve requests.
    fn is_ready(&self) -> bool {
        self.model_info().available
    }
}

// ────────────────────────────────────────────────────────────────────
// Hash-projection embedder (fallback)
// ────────────────────────────────────────────────────────────────────

/// Deterministic fallback embedder: token-hash bag-of-words projection.
///
/// Each whitespace token of the normalized text is hashed into one of
/// [`HASH_EMBEDDER_DIM`] slots (sign taken from another hash bit), and the
/// resulting term-frequency vector is L2-normalized. Texts sharing tokens
/// have positive cosine similarity; disjoint texts are near-orthogonal.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    info: ModelInfo,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashEmbedder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: ModelInfo {
                id: "kb-hash-64".to_string(),
                dimension: HASH_EMBEDDER_DIM,
                available: true,
            },
        }
    }

    /// Construct with a custom model id (keeps cache keys distinct when two
    /// logical models share the hash implementation).
    #[must_use]
    pub fn with_model_id(id: impl Into<String>) -> Self {
        Self {
            info: ModelInfo {
                id: id.into(),
                dimension: HASH_EMBEDDER_DIM,
                available: true,
            },
        }
    }

    fn token_slot(token: &str) -> (usize, f32) {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let slot = usize::from(digest[0]) % HASH_EMBEDDER_DIM;
        let sign = if digest[1] & 1 == 0 { 1.0 } else { -1.0 };
        (slot, sign)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> SearchResult<EmbeddingVec> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(SearchError::EmbeddingFailed(
                "cannot embed empty text".to_string(),
            ));
        }
        let mut v = vec![0.0f32; HASH_EMBEDDER_DIM];
        for token in normalized.split(' ') {
            let (slot, sign) = Self::token_slot(token);
            v[slot] += sign;
        }
        Ok(normalize_l2(&v))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }
}

/// An embedder that always fails. Used to exercise degraded paths in tests.
#[derive(Debug, Clone)]
pub struct UnavailableEmbedder {
    info: ModelInfo,
}

impl Default for UnavailableEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl UnavailableEmbedder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: ModelInfo {
                id: "kb-unavailable".to_string(),
                dimension: HASH_EMBEDDER_DIM,
                available: false,
            },
        }
    }
}

impl Embedder for UnavailableEmbedder {
    fn embed(&self, _text: &str) -> SearchResult<EmbeddingVec> {
        Err(SearchError::EmbeddingFailed(
            "embedding model not loaded".to_string(),
        ))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_folds_case_and_whitespace() {
        assert_eq!(normalize_text("  Hello\t\tWorld \n"), "hello world");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn content_hash_is_stable_under_formatting() {
        assert_eq!(content_hash("Hello World"), content_hash("  hello\nworld "));
        assert_ne!(content_hash("hello world"), content_hash("hello worlds"));
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new();
        let a = e.embed("install the package").unwrap();
        let b = e.embed("install the package").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_disjoint_texts() {
        let e = HashEmbedder::new();
        let a = e.embed("pip install foo package").unwrap();
        let b = e.embed("pip install bar package").unwrap();
        let c = e.embed("quarterly revenue statement").unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn empty_text_fails_to_embed() {
        let e = HashEmbedder::new();
        assert!(matches!(
            e.embed("   "),
            Err(SearchError::EmbeddingFailed(_))
        ));
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
