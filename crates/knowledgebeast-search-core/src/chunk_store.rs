//! Per-project chunk store.
//!
//! The authoritative in-memory copy of every ingested chunk (text, vector,
//! metadata). Result assembly, MMR, and export read from here; the keyword
//! index is rebuildable from it. Writes replace whole documents so queries
//! never observe a half-replaced document.

use std::collections::HashMap;
use std::sync::RwLock;

use knowledgebeast_core::Chunk;

/// Thread-safe chunk storage for one project.
#[derive(Debug, Default)]
pub struct ChunkStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: HashMap<String, Chunk>,
    doc_chunks: HashMap<String, Vec<String>>,
    total_bytes: u64,
}

impl ChunkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all chunks of `doc_id` atomically.
    pub fn upsert_document(&self, doc_id: &str, chunks: Vec<Chunk>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = inner.doc_chunks.remove(doc_id) {
            for chunk_id in old {
                if let Some(removed) = inner.chunks.remove(&chunk_id) {
                    inner.total_bytes = inner
                        .total_bytes
                        .saturating_sub(removed.text.len() as u64);
                }
            }
        }
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ids.push(chunk.chunk_id.clone());
            inner.total_bytes += chunk.text.len() as u64;
            inner.chunks.insert(chunk.chunk_id.clone(), chunk);
        }
        if !ids.is_empty() {
            inner.doc_chunks.insert(doc_id.to_string(), ids);
        }
    }

    /// Remove every chunk of `doc_id`. Unknown ids are a no-op.
    pub fn remove_document(&self, doc_id: &str) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(ids) = inner.doc_chunks.remove(doc_id) {
            for chunk_id in ids {
                if let Some(removed) = inner.chunks.remove(&chunk_id) {
                    inner.total_bytes = inner
                        .total_bytes
                        .saturating_sub(removed.text.len() as u64);
                }
            }
        }
    }

    /// Fetch one chunk by id.
    #[must_use]
    pub fn get(&self, chunk_id: &str) -> Option<Chunk> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.chunks.get(chunk_id).cloned()
    }

    /// Fetch several chunks; absent ids are silently omitted.
    #[must_use]
    pub fn get_many(&self, chunk_ids: &[String]) -> Vec<Chunk> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        chunk_ids
            .iter()
            .filter_map(|id| inner.chunks.get(id).cloned())
            .collect()
    }

    /// Whether `doc_id` has any stored chunks.
    #[must_use]
    pub fn contains_document(&self, doc_id: &str) -> bool {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.doc_chunks.contains_key(doc_id)
    }

    #[must_use]
    pub fn doc_count(&self) -> usize {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.doc_chunks.len()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.chunks.len()
    }

    /// Total stored text bytes (quota accounting).
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.total_bytes
    }

    /// All document ids, sorted for deterministic export.
    #[must_use]
    pub fn doc_ids(&self) -> Vec<String> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ids: Vec<String> = inner.doc_chunks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All chunks of one document in ordinal order.
    #[must_use]
    pub fn document_chunks(&self, doc_id: &str) -> Vec<Chunk> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut chunks: Vec<Chunk> = inner
            .doc_chunks
            .get(doc_id)
            .map(|ids| ids.iter().filter_map(|id| inner.chunks.get(id).cloned()).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        chunks
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *inner = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_id: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            chunk_id: Chunk::derive_id(doc_id, ordinal),
            doc_id: doc_id.to_string(),
            ordinal,
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            vector: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn upsert_replaces_prior_document() {
        let store = ChunkStore::new();
        store.upsert_document("d1", vec![chunk("d1", 0, "one"), chunk("d1", 1, "two")]);
        assert_eq!(store.chunk_count(), 2);

        store.upsert_document("d1", vec![chunk("d1", 0, "replacement")]);
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.get(&Chunk::derive_id("d1", 0)).unwrap().text, "replacement");
        assert!(store.get(&Chunk::derive_id("d1", 1)).is_none());
    }

    #[test]
    fn byte_accounting_tracks_replacements_and_removals() {
        let store = ChunkStore::new();
        store.upsert_document("d1", vec![chunk("d1", 0, "abcd")]);
        assert_eq!(store.total_bytes(), 4);
        store.upsert_document("d1", vec![chunk("d1", 0, "ab")]);
        assert_eq!(store.total_bytes(), 2);
        store.remove_document("d1");
        assert_eq!(store.total_bytes(), 0);
        assert_eq!(store.doc_count(), 0);
    }

    #[test]
    fn document_chunks_come_back_in_ordinal_order() {
        let store = ChunkStore::new();
        store.upsert_document(
            "d1",
            vec![chunk("d1", 2, "c"), chunk("d1", 0, "a"), chunk("d1", 1, "b")],
        );
        let texts: Vec<String> = store.document_chunks("d1").into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn get_many_omits_missing_ids() {
        let store = ChunkStore::new();
        store.upsert_document("d1", vec![chunk("d1", 0, "a")]);
        let got = store.get_many(&[
            Chunk::derive_id("d1", 0),
            Chunk::derive_id("d1", 9),
        ]);
        assert_eq!(got.len(), 1);
    }
}
