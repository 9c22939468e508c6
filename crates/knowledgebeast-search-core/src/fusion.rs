//! Score normalization and hybrid fusion.
//!
//! Each retrieval stream is min-max normalized to `[0, 1]` over the
//! candidates it returned (an all-equal stream normalizes to 1.0), then
//! fused as `alpha * vector + (1 - alpha) * keyword`. A candidate missing
//! from one stream contributes 0 for that stream. Ordering is deterministic:
//! fused score descending, then `chunk_id` ascending.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::keyword::KeywordHit;
use crate::vector::ScoredChunk;

/// A candidate after fusion, carrying per-stream components for explain.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub doc_id: String,
    /// Normalized vector-stream score, when present in that stream.
    pub vector_score: Option<f32>,
    /// Normalized keyword-stream score, when present in that stream.
    pub keyword_score: Option<f32>,
    pub fused_score: f32,
}

/// Min-max normalize to `[0, 1]` over the given values.
///
/// All-equal inputs (including a single candidate) normalize to 1.0: the
/// stream expressed no preference, so every candidate is equally "best".
#[must_use]
pub fn min_max_normalize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
    }
    let range = max - min;
    if range <= f32::EPSILON {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

/// Fuse normalized vector and keyword streams.
#[must_use]
pub fn fuse(vector_hits: &[ScoredChunk], keyword_hits: &[KeywordHit], alpha: f32) -> Vec<FusedCandidate> {
    let vector_norm = min_max_normalize(&vector_hits.iter().map(|h| h.score).collect::<Vec<_>>());
    let keyword_norm =
        min_max_normalize(&keyword_hits.iter().map(|h| h.score).collect::<Vec<_>>());

    struct Partial {
        doc_id: String,
        vector: Option<f32>,
        keyword: Option<f32>,
    }

    let mut merged: HashMap<String, Partial> = HashMap::new();
    for (hit, norm) in vector_hits.iter().zip(&vector_norm) {
        merged.insert(
            hit.chunk_id.clone(),
            Partial {
                doc_id: hit.doc_id.clone(),
                vector: Some(*norm),
                keyword: None,
            },
        );
    }
    for (hit, norm) in keyword_hits.iter().zip(&keyword_norm) {
        merged
            .entry(hit.chunk_id.clone())
            .and_modify(|p| p.keyword = Some(*norm))
            .or_insert_with(|| Partial {
                doc_id: hit.doc_id.clone(),
                vector: None,
                keyword: Some(*norm),
            });
    }

    let mut fused: Vec<FusedCandidate> = merged
        .into_iter()
        .map(|(chunk_id, partial)| {
            let v = partial.vector.unwrap_or(0.0);
            let k = partial.keyword.unwrap_or(0.0);
            FusedCandidate {
                chunk_id,
                doc_id: partial.doc_id,
                vector_score: partial.vector,
                keyword_score: partial.keyword,
                fused_score: alpha.mul_add(v, (1.0 - alpha) * k),
            }
        })
        .collect();
    fused.sort_by(fused_cmp);
    fused
}

/// Deterministic candidate ordering: fused score descending, then
/// `chunk_id` ascending.
#[must_use]
pub fn fused_cmp(a: &FusedCandidate, b: &FusedCandidate) -> Ordering {
    match b
        .fused_score
        .partial_cmp(&a.fused_score)
        .unwrap_or(Ordering::Equal)
    {
        Ordering::Equal => a.chunk_id.cmp(&b.chunk_id),
        ord => ord,
    }
}
