//! Maximal Marginal Relevance diversification.
//!
//! Greedy selection maximizing `lambda * relevance - (1 - lambda) *
//! max_similarity_to_selected`. Near-ties absorb re-ranker and hardware
//! nondeterminism by breaking on `chunk_id` ascending, so the final ordering
//! is deterministic for identical inputs.

use crate::embedder::cosine_similarity;

/// One MMR candidate: identity, relevance, and an optional vector for the
/// redundancy term. Candidates without vectors are treated as orthogonal to
/// everything (similarity 0).
#[derive(Debug, Clone)]
pub struct MmrCandidate {
    pub chunk_id: String,
    pub relevance: f32,
    pub vector: Option<Vec<f32>>,
}

/// Select up to `k` candidates in MMR order; returns indices into the input.
///
/// `lambda` is clamped into `[0, 1]`: 1.0 is pure relevance (input order),
/// 0.0 is pure diversity.
#[must_use]
pub fn mmr_select(candidates: &[MmrCandidate], lambda: f32, k: usize) -> Vec<usize> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }
    let lambda = lambda.clamp(0.0, 1.0);
    let k = k.min(candidates.len());

    let mut selected: Vec<usize> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0usize;
        let mut best_score = f32::NEG_INFINITY;

        for (pos, &idx) in remaining.iter().enumerate() {
            let candidate = &candidates[idx];
            let redundancy = selected
                .iter()
                .map(|&sel| similarity(candidate, &candidates[sel]))
                .fold(0.0f32, f32::max);
            let score = lambda.mul_add(candidate.relevance, -((1.0 - lambda) * redundancy));

            let wins = score > best_score
                || (score == best_score
                    && candidate.chunk_id < candidates[remaining[best_pos]].chunk_id);
            if wins {
                best_score = score;
                best_pos = pos;
            }
        }

        selected.push(remaining.swap_remove(best_pos));
    }

    selected
}

fn similarity(a: &MmrCandidate, b: &MmrCandidate) -> f32 {
    match (&a.vector, &b.vector) {
        (Some(va), Some(vb)) => cosine_similarity(va, vb),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(chunk_id: &str, relevance: f32, vector: Option<Vec<f32>>) -> MmrCandidate {
        MmrCandidate {
            chunk_id: chunk_id.to_string(),
            relevance,
            vector,
        }
    }

    #[test]
    fn empty_input_and_zero_k_yield_nothing() {
        assert!(mmr_select(&[], 0.5, 3).is_empty());
        let c = [candidate("a", 1.0, None)];
        assert!(mmr_select(&c, 0.5, 0).is_empty());
    }

    #[test]
    fn pure_relevance_keeps_score_order() {
        let cands = [
            candidate("a", 0.9, Some(vec![1.0, 0.0])),
            candidate("b", 0.5, Some(vec![1.0, 0.0])),
            candidate("c", 0.7, Some(vec![1.0, 0.0])),
        ];
        let order = mmr_select(&cands, 1.0, 3);
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn diversity_penalizes_near_duplicates() {
        // Two near-identical high scorers and one distinct medium scorer:
        // with diversity on, the distinct one must beat the duplicate.
        let cands = [
            candidate("a", 0.95, Some(vec![1.0, 0.0])),
            candidate("b", 0.94, Some(vec![1.0, 0.0])),
            candidate("c", 0.60, Some(vec![0.0, 1.0])),
        ];
        let order = mmr_select(&cands, 0.5, 3);
        assert_eq!(order[0], 0);
        assert_eq!(order[1], 2, "diverse candidate should displace the duplicate");
        assert_eq!(order[2], 1);
    }

    #[test]
    fn selection_is_capped_at_k() {
        let cands = [
            candidate("a", 0.9, None),
            candidate("b", 0.8, None),
            candidate("c", 0.7, None),
        ];
        assert_eq!(mmr_select(&cands, 0.7, 2).len(), 2);
    }

    #[test]
    fn ties_break_by_chunk_id() {
        let cands = [
            candidate("zz", 0.5, None),
            candidate("aa", 0.5, None),
        ];
        let order = mmr_select(&cands, 1.0, 2);
        assert_eq!(order[0], 1, "equal scores must prefer the smaller chunk_id");
    }

    #[test]
    fn missing_vectors_incur_no_redundancy_penalty() {
        let cands = [
            candidate("a", 0.9, None),
            candidate("b", 0.8, None),
        ];
        let order = mmr_select(&cands, 0.3, 2);
        assert_eq!(order, vec![0, 1]);
    }
}
