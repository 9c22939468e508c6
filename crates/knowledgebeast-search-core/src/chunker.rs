//! Document chunking.
//!
//! Splits plain text into ordered passages for embedding and indexing. Two
//! strategies:
//!
//! - **Recursive**: split at the highest-level separator that keeps each
//!   piece within the token budget — paragraph, then sentence, then word,
//!   then raw characters. Adjacent chunks share `overlap_tokens` tokens.
//! - **Semantic**: embed each sentence and start a new chunk when the cosine
//!   similarity to the running-mean embedding drops below a threshold,
//!   subject to a soft minimum and hard maximum chunk size.
//!
//! Token counting is whitespace-word based throughout; both strategies emit
//! at least one chunk for any non-empty input.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedder::{Embedder, cosine_similarity};
use crate::embedding_cache::EmbeddingCache;
use crate::error::{SearchError, SearchResult};

/// Chunking strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    Recursive,
    Semantic,
}

/// Chunker tuning parameters.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub chunk_size_tokens: usize,
    pub overlap_tokens: usize,
    pub strategy: ChunkStrategy,
    /// Semantic strategy: cosine drop threshold for starting a new chunk.
    pub semantic_threshold: f32,
    /// Semantic strategy: do not break before this many tokens.
    pub semantic_soft_min_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 256,
            overlap_tokens: 32,
            strategy: ChunkStrategy::Recursive,
            semantic_threshold: 0.35,
            semantic_soft_min_tokens: 32,
        }
    }
}

/// One produced passage, before document identity is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPiece {
    /// 0-based position within the document.
    pub ordinal: u32,
    pub text: String,
    pub token_count: usize,
}

/// Count whitespace-separated tokens.
#[must_use]
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Text chunker. Semantic strategy routes sentence embeddings through the
/// shared embedding cache.
pub struct Chunker {
    config: ChunkerConfig,
    embedder: Arc<dyn Embedder>,
    embeddings: Arc<EmbeddingCache>,
}

impl Chunker {
    /// # Errors
    /// Rejects a zero chunk size or an overlap as large as the chunk size.
    pub fn new(
        config: ChunkerConfig,
        embedder: Arc<dyn Embedder>,
        embeddings: Arc<EmbeddingCache>,
    ) -> SearchResult<Self> {
        if config.chunk_size_tokens == 0 {
            return Err(SearchError::InvalidConfig(
                "chunk_size_tokens must be at least 1".to_string(),
            ));
        }
        if config.overlap_tokens >= config.chunk_size_tokens {
            return Err(SearchError::InvalidConfig(format!(
                "overlap_tokens ({}) must be smaller than chunk_size_tokens ({})",
                config.overlap_tokens, config.chunk_size_tokens
            )));
        }
        Ok(Self {
            config,
            embedder,
            embeddings,
        })
    }

    /// Split `text` into ordered chunks. Empty/whitespace input yields an
    /// empty vec; any other input yields at least one chunk.
    ///
    /// # Errors
    /// The semantic strategy can fail when the embedder is unavailable; the
    /// recursive strategy never fails.
    pub fn chunk(&self, text: &str) -> SearchResult<Vec<ChunkPiece>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pieces = match self.config.strategy {
            ChunkStrategy::Recursive => self.chunk_recursive(text),
            ChunkStrategy::Semantic => self.chunk_semantic(text)?,
        };
        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let token_count = token_count(&text);
                ChunkPiece {
                    ordinal: u32::try_from(i).unwrap_or(u32::MAX),
                    text,
                    token_count,
                }
            })
            .collect())
    }

    // ── Recursive strategy ─────────────────────────────────────────────

    fn chunk_recursive(&self, text: &str) -> Vec<String> {
        let budget = self.config.chunk_size_tokens;
        // Units are capped at budget minus overlap so that a carried tail
        // plus the next unit never pushes a chunk past the budget.
        let unit_budget = budget.saturating_sub(self.config.overlap_tokens).max(1);
        let mut units = split_paragraphs(text);

        // Any unit over the cap is split at the next separator level down.
        units = units
            .into_iter()
            .flat_map(|u| {
                if token_count(&u) <= unit_budget {
                    vec![u]
                } else {
                    explode_oversized(&u, unit_budget)
                }
            })
            .collect();

        self.pack_with_overlap(&units)
    }

    /// Greedily pack units into chunks within the token budget, carrying the
    /// previous chunk's tail tokens into the next chunk as overlap.
    fn pack_with_overlap(&self, units: &[String]) -> Vec<String> {
        let budget = self.config.chunk_size_tokens;
        let overlap = self.config.overlap_tokens;

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for unit in units {
            let unit_tokens = token_count(unit);
            if unit_tokens == 0 {
                continue;
            }
            if current_tokens > 0 && current_tokens + unit_tokens > budget {
                let finished = std::mem::take(&mut current);
                current_tokens = 0;
                if overlap > 0 {
                    let tail = tail_tokens(&finished, overlap);
                    if !tail.is_empty() {
                        current_tokens = token_count(&tail);
                        current = tail;
                    }
                }
                chunks.push(finished);
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(unit);
            current_tokens += unit_tokens;
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }
        chunks
    }

    // ── Semantic strategy ──────────────────────────────────────────────

    fn chunk_semantic(&self, text: &str) -> SearchResult<Vec<String>> {
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return Ok(vec![text.to_string()]);
        }

        let hard_max = self.config.chunk_size_tokens;
        let soft_min = self.config.semantic_soft_min_tokens.min(hard_max);

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;
        let mut mean: Vec<f32> = Vec::new();
        let mut members = 0usize;

        for sentence in &sentences {
            let sent_tokens = token_count(sentence);
            if sent_tokens == 0 {
                continue;
            }
            let vector = self.embeddings.get_or_embed(self.embedder.as_ref(), sentence)?;

            let boundary = if current.is_empty() || members == 0 {
                false
            } else if current_tokens + sent_tokens > hard_max {
                true
            } else if current_tokens < soft_min {
                false
            } else {
                cosine_similarity(&vector, &mean) < self.config.semantic_threshold
            };

            if boundary {
                chunks.push(current.join(" "));
                current.clear();
                current_tokens = 0;
                mean.clear();
                members = 0;
            }

            current.push(sentence);
            current_tokens += sent_tokens;
            accumulate_mean(&mut mean, &vector, &mut members);
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }
        if chunks.is_empty() {
            chunks.push(text.to_string());
        }
        Ok(chunks)
    }
}

/// Fold `vector` into the running mean in place.
#[allow(clippy::cast_precision_loss)]
fn accumulate_mean(mean: &mut Vec<f32>, vector: &[f32], members: &mut usize) {
    if mean.is_empty() {
        mean.extend_from_slice(vector);
        *members = 1;
        return;
    }
    let n = *members as f32;
    for (m, v) in mean.iter_mut().zip(vector) {
        *m = m.mul_add(n, *v) / (n + 1.0);
    }
    *members += 1;
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sentence boundaries: terminal punctuation followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?')
            && bytes.get(i + 1).is_none_or(|b| b.is_ascii_whitespace())
        {
            let sentence = text[start..=i].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = i + 1;
        }
        i += 1;
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Split an over-budget paragraph into sentence units, then words, then raw
/// character windows as a last resort.
fn explode_oversized(unit: &str, budget: usize) -> Vec<String> {
    let sentences = split_sentences(unit);
    let mut out = Vec::new();
    for sentence in sentences {
        if token_count(sentence) <= budget {
            out.push(sentence.to_string());
            continue;
        }
        // Word-level windows.
        let words: Vec<&str> = sentence.split_whitespace().collect();
        for window in words.chunks(budget.max(1)) {
            let joined = window.join(" ");
            if token_count(&joined) <= budget || budget == 0 {
                out.push(joined);
            } else {
                // A single "word" longer than the budget: fall back to fixed
                // character windows so no input can defeat the splitter.
                let chars: Vec<char> = joined.chars().collect();
                for piece in chars.chunks(512) {
                    out.push(piece.iter().collect());
                }
            }
        }
    }
    if out.is_empty() {
        out.push(unit.to_string());
    }
    out
}

/// The last `n` tokens of `text`, joined by single spaces.
fn tail_tokens(text: &str, n: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let start = tokens.len().saturating_sub(n);
    tokens[start..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;

    fn recursive_chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(
            ChunkerConfig {
                chunk_size_tokens: size,
                overlap_tokens: overlap,
                strategy: ChunkStrategy::Recursive,
                ..ChunkerConfig::default()
            },
            Arc::new(HashEmbedder::new()),
            Arc::new(EmbeddingCache::new(64).unwrap()),
        )
        .unwrap()
    }

    fn semantic_chunker(size: usize) -> Chunker {
        Chunker::new(
            ChunkerConfig {
                chunk_size_tokens: size,
                overlap_tokens: 0,
                strategy: ChunkStrategy::Semantic,
                semantic_threshold: 0.2,
                semantic_soft_min_tokens: 2,
            },
            Arc::new(HashEmbedder::new()),
            Arc::new(EmbeddingCache::new(256).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunker = recursive_chunker(16, 4);
        assert!(chunker.chunk("").unwrap().is_empty());
        assert!(chunker.chunk("   \n\n  ").unwrap().is_empty());
    }

    #[test]
    fn short_input_yields_exactly_one_chunk() {
        let chunker = recursive_chunker(64, 8);
        let chunks = chunker.chunk("# Install\n\npip install foo").unwrap();
        assert_eq!(chunks.len(), 1, "small docs must not be over-split");
        assert_eq!(chunks[0].ordinal, 0);
        assert!(chunks[0].text.contains("pip install foo"));
    }

    #[test]
    fn chunks_respect_the_token_budget() {
        let chunker = recursive_chunker(10, 0);
        let text = (0..60).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk(&text).unwrap();
        assert!(chunks.len() >= 6);
        for c in &chunks {
            assert!(c.token_count <= 10, "chunk exceeded budget: {}", c.token_count);
        }
    }

    #[test]
    fn ordinals_are_dense_and_zero_based() {
        let chunker = recursive_chunker(8, 2);
        let text = (0..40).map(|i| format!("tok{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk(&text).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal as usize, i);
        }
    }

    #[test]
    fn overlap_carries_tail_tokens_forward() {
        let chunker = recursive_chunker(6, 2);
        let text = (0..18).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk(&text).unwrap();
        assert!(chunks.len() >= 2);
        let first_tail: Vec<&str> = chunks[0].text.split_whitespace().rev().take(2).collect();
        for token in first_tail {
            assert!(
                chunks[1].text.contains(token),
                "overlap token {token} missing from next chunk"
            );
        }
        // Overlap never pushes a chunk past the budget.
        for c in &chunks {
            assert!(c.token_count <= 6);
        }
    }

    #[test]
    fn concatenation_preserves_all_content_words() {
        let chunker = recursive_chunker(8, 0);
        let text = "alpha beta gamma.\n\ndelta epsilon zeta eta theta iota kappa.\n\nlambda mu";
        let chunks = chunker.chunk(&text).unwrap();
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" ");
        for word in ["alpha", "theta", "kappa", "lambda", "mu"] {
            assert!(joined.contains(word), "lost content word {word}");
        }
    }

    #[test]
    fn semantic_strategy_splits_on_topic_shift() {
        let chunker = semantic_chunker(128);
        let text = "install the package with pip. install the wheel with pip. \
                    quarterly revenue grew strongly. revenue margins expanded.";
        let chunks = chunker.chunk(text).unwrap();
        assert!(!chunks.is_empty());
        // Both topics survive somewhere regardless of boundary placement.
        let joined: String = chunks.iter().map(|c| c.text.clone()).collect();
        assert!(joined.contains("pip"));
        assert!(joined.contains("revenue"));
    }

    #[test]
    fn semantic_strategy_emits_one_chunk_for_single_sentence() {
        let chunker = semantic_chunker(64);
        let chunks = chunker.chunk("just one short sentence.").unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn pathological_unbroken_token_still_chunks() {
        let chunker = recursive_chunker(4, 0);
        let text = "x".repeat(5000);
        let chunks = chunker.chunk(&text).unwrap();
        assert!(!chunks.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
        let cache = Arc::new(EmbeddingCache::new(4).unwrap());
        let bad = ChunkerConfig {
            chunk_size_tokens: 8,
            overlap_tokens: 8,
            ..ChunkerConfig::default()
        };
        assert!(Chunker::new(bad, embedder, cache).is_err());
    }
}
