//! Per-project keyword index: in-memory inverted index + BM25 scoring.
//!
//! # Tokenization
//!
//! NFKC-normalize, lowercase, split on non-alphanumeric boundaries, drop
//! single-character tokens, drop a small fixed English stopword list. The
//! exact stopword membership is an implementation detail and deliberately
//! not part of the public contract.
//!
//! # Concurrency
//!
//! Readers are never blocked by writers: the index publishes immutable
//! snapshots behind an `RwLock<Arc<Snapshot>>`. A query clones the `Arc` and
//! scores against a consistent snapshot. Writers serialize on a separate
//! mutex, build the next snapshot off-lock from the current one, and swap it
//! in under a brief write lock.
//!
//! # Determinism
//!
//! Results order by BM25 score descending, then `chunk_id` ascending, so a
//! fixed index state and query always produce the same ordering.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// BM25 parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// A scored hit from the keyword index.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f32,
}

/// Stopwords removed during tokenization. Implementation-defined; callers
/// must not rely on specific membership.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Tokenize text for indexing and querying.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .filter(|t| !is_stopword(t))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    doc_id: String,
    term_freqs: HashMap<String, u32>,
    length: u32,
}

/// Immutable published state of the index.
#[derive(Debug, Default)]
struct Snapshot {
    /// `chunk_id → entry`.
    chunks: HashMap<String, ChunkEntry>,
    /// `term → postings (chunk_id → tf)`, derived from `chunks`.
    postings: HashMap<String, Vec<(String, u32)>>,
    /// `doc_id → chunk ids`, for whole-document replacement.
    doc_chunks: HashMap<String, Vec<String>>,
    /// Sum of chunk lengths, for the BM25 average.
    total_length: u64,
}

impl Snapshot {
    fn rebuild_postings(&mut self) {
        let mut postings: HashMap<String, Vec<(String, u32)>> = HashMap::new();
        for (chunk_id, entry) in &self.chunks {
            for (term, tf) in &entry.term_freqs {
                postings
                    .entry(term.clone())
                    .or_default()
                    .push((chunk_id.clone(), *tf));
            }
        }
        // Sorted postings keep scoring iteration deterministic.
        for list in postings.values_mut() {
            list.sort_by(|a, b| a.0.cmp(&b.0));
        }
        self.postings = postings;
        self.total_length = self.chunks.values().map(|e| u64::from(e.length)).sum();
    }
}

/// The per-project BM25 index. See the module docs for the concurrency model.
pub struct KeywordIndex {
    params: Bm25Params,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes writers; never held while scoring.
    writer: Mutex<()>,
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

impl KeywordIndex {
    #[must_use]
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, next: Snapshot) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(next);
    }

    /// Replace all chunks of `doc_id` with `chunks` (`(chunk_id, text)`).
    ///
    /// The replacement is atomic from a reader's perspective: queries see
    /// either the prior document state or the full new one.
    pub fn upsert_document(&self, doc_id: &str, chunks: &[(String, String)]) {
        let _writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = self.current();

        let mut next = Snapshot {
            chunks: current.chunks.clone(),
            postings: HashMap::new(),
            doc_chunks: current.doc_chunks.clone(),
            total_length: 0,
        };

        if let Some(old_chunk_ids) = next.doc_chunks.remove(doc_id) {
            for chunk_id in old_chunk_ids {
                next.chunks.remove(&chunk_id);
            }
        }

        let mut new_ids = Vec::with_capacity(chunks.len());
        for (chunk_id, text) in chunks {
            let tokens = tokenize(text);
            let length = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *term_freqs.entry(token).or_insert(0) += 1;
            }
            next.chunks.insert(
                chunk_id.clone(),
                ChunkEntry {
                    doc_id: doc_id.to_string(),
                    term_freqs,
                    length,
                },
            );
            new_ids.push(chunk_id.clone());
        }
        if !new_ids.is_empty() {
            next.doc_chunks.insert(doc_id.to_string(), new_ids);
        }

        next.rebuild_postings();
        self.publish(next);
    }

    /// Remove every chunk of `doc_id`. Unknown ids are a no-op.
    pub fn remove_document(&self, doc_id: &str) {
        let _writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = self.current();
        if !current.doc_chunks.contains_key(doc_id) {
            return;
        }

        let mut next = Snapshot {
            chunks: current.chunks.clone(),
            postings: HashMap::new(),
            doc_chunks: current.doc_chunks.clone(),
            total_length: 0,
        };
        if let Some(chunk_ids) = next.doc_chunks.remove(doc_id) {
            for chunk_id in chunk_ids {
                next.chunks.remove(&chunk_id);
            }
        }
        next.rebuild_postings();
        self.publish(next);
    }

    /// Drop everything.
    pub fn clear(&self) {
        let _writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.publish(Snapshot::default());
    }

    /// Number of indexed chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.current().chunks.len()
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.current().doc_chunks.len()
    }

    /// BM25 top-`k` for `query`. Candidates must contain at least one query
    /// term; an empty or fully-stopworded query returns an empty result.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn search(&self, query: &str, k: usize) -> Vec<KeywordHit> {
        if k == 0 {
            return Vec::new();
        }
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let snapshot = self.current();
        let n = snapshot.chunks.len();
        if n == 0 {
            return Vec::new();
        }
        let avg_len = snapshot.total_length as f32 / n as f32;

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in &terms {
            let Some(postings) = snapshot.postings.get(term) else {
                continue;
            };
            let df = postings.len() as f32;
            // BM25 idf with the +1 inside the log keeps scores positive even
            // for terms present in most chunks.
            let idf = ((n as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (chunk_id, tf) in postings {
                let entry = &snapshot.chunks[chunk_id];
                let tf = *tf as f32;
                let len_norm = self.params.k1
                    * (1.0 - self.params.b + self.params.b * entry.length as f32 / avg_len);
                let contribution = idf * (tf * (self.params.k1 + 1.0)) / (tf + len_norm);
                *scores.entry(chunk_id.as_str()).or_insert(0.0) += contribution;
            }
        }

        let mut hits: Vec<KeywordHit> = scores
            .into_iter()
            .map(|(chunk_id, score)| KeywordHit {
                chunk_id: chunk_id.to_string(),
                doc_id: snapshot.chunks[chunk_id].doc_id.clone(),
                score,
            })
            .collect();
        hits.sort_by(keyword_hit_cmp);
        hits.truncate(k);
        hits
    }
}

/// Score descending, then `chunk_id` ascending.
fn keyword_hit_cmp(a: &KeywordHit, b: &KeywordHit) -> Ordering {
    match b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal) {
        Ordering::Equal => a.chunk_id.cmp(&b.chunk_id),
        ord => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str) -> (String, String) {
        (id.to_string(), text.to_string())
    }

    fn index_with_docs() -> KeywordIndex {
        let index = KeywordIndex::default();
        index.upsert_document(
            "doc-a",
            &[
                chunk("doc-a#0000", "pip install foo from the package index"),
                chunk("doc-a#0001", "configure foo after installation"),
            ],
        );
        index.upsert_document(
            "doc-b",
            &[chunk("doc-b#0000", "quarterly revenue and margin expansion")],
        );
        index
    }

    #[test]
    fn tokenize_folds_case_and_strips_punctuation() {
        let tokens = tokenize("Install, the PACKAGE!  (v2)");
        assert!(tokens.contains(&"install".to_string()));
        assert!(tokens.contains(&"package".to_string()));
        assert!(tokens.contains(&"v2".to_string()));
        // Single-character fragments are dropped.
        assert!(!tokens.iter().any(|t| t.chars().count() < 2));
    }

    #[test]
    fn search_finds_matching_chunks_only() {
        let index = index_with_docs();
        let hits = index.search("install", 10);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.doc_id == "doc-a"));
        let hits = index.search("revenue", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "doc-b#0000");
    }

    #[test]
    fn empty_query_returns_empty_without_failing() {
        let index = index_with_docs();
        assert!(index.search("", 10).is_empty());
        assert!(index.search("   ", 10).is_empty());
        assert!(index.search("!!!", 10).is_empty());
    }

    #[test]
    fn zero_top_k_returns_empty() {
        let index = index_with_docs();
        assert!(index.search("install", 0).is_empty());
    }

    #[test]
    fn results_are_deterministic_across_calls() {
        let index = index_with_docs();
        let a = index.search("foo install", 10);
        let b = index.search("foo install", 10);
        assert_eq!(a, b);
    }

    #[test]
    fn ties_break_by_chunk_id_ascending() {
        let index = KeywordIndex::default();
        index.upsert_document(
            "doc-a",
            &[
                chunk("doc-a#0001", "identical twin text"),
                chunk("doc-a#0000", "identical twin text"),
            ],
        );
        let hits = index.search("twin", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "doc-a#0000");
        assert_eq!(hits[1].chunk_id, "doc-a#0001");
    }

    #[test]
    fn upsert_replaces_prior_document_state() {
        let index = index_with_docs();
        index.upsert_document("doc-a", &[chunk("doc-a#0000", "entirely new topic")]);
        assert!(index.search("install", 10).is_empty());
        assert_eq!(index.search("topic", 10).len(), 1);
        assert_eq!(index.chunk_count(), 2);
    }

    #[test]
    fn remove_document_purges_all_chunks() {
        let index = index_with_docs();
        index.remove_document("doc-a");
        assert!(index.search("install", 10).is_empty());
        assert_eq!(index.doc_count(), 1);
        // Removing again is a harmless no-op.
        index.remove_document("doc-a");
        assert_eq!(index.doc_count(), 1);
    }

    #[test]
    fn rarer_terms_rank_higher() {
        let index = KeywordIndex::default();
        index.upsert_document("d1", &[chunk("d1#0000", "common word alpha")]);
        index.upsert_document("d2", &[chunk("d2#0000", "common word beta")]);
        index.upsert_document("d3", &[chunk("d3#0000", "common word gamma")]);
        let hits = index.search("common beta", 10);
        assert_eq!(hits[0].chunk_id, "d2#0000", "chunk matching the rare term wins");
    }

    #[test]
    fn readers_see_consistent_snapshots_during_writes() {
        use std::sync::Arc as StdArc;
        let index = StdArc::new(KeywordIndex::default());
        index.upsert_document("doc", &[chunk("doc#0000", "stable searchable text")]);

        std::thread::scope(|s| {
            let writer_index = StdArc::clone(&index);
            s.spawn(move || {
                for i in 0..50 {
                    writer_index.upsert_document(
                        "doc",
                        &[chunk("doc#0000", &format!("stable searchable text v{i}"))],
                    );
                }
            });
            let reader_index = StdArc::clone(&index);
            s.spawn(move || {
                for _ in 0..200 {
                    let hits = reader_index.search("stable", 10);
                    // The document is never observed half-written.
                    assert_eq!(hits.len(), 1);
                }
            });
        });
    }
}
