//! Ingest pipeline: resolve → parse → chunk → embed → write.
//!
//! A batch fans out across a bounded worker pool (scoped threads); each
//! document runs the full pipeline independently and reports its own
//! outcome — one bad document never fails the batch.
//!
//! # Write discipline
//!
//! Per document, vectors are upserted first, then the local keyword index
//! and chunk store are updated under the project write lock. The local
//! update is deferred until after vector success, so a vector failure leaves
//! no trace; if the local update fails after the vectors landed, the vector
//! writes are rolled back with `delete_by_doc` before the document is
//! failed. Queries therefore never observe a chunk in one index but not the
//! other.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use knowledgebeast_core::{
    Chunk, ContentType, DocumentMeta, IngestItem, IngestItemOutcome, IngestResponse, KbError,
    KbResult, now_micros,
};
use knowledgebeast_search_core::{
    Chunker, EmbeddingCache, VectorRecord, VectorStoreAdapter, embedder::Embedder,
};

use crate::projects::ProjectHandle;
use crate::quota::QuotaLimits;

/// Everything a batch needs besides the project handle.
pub struct IngestDeps<'a> {
    pub chunker: &'a Chunker,
    pub embedder: &'a dyn Embedder,
    pub embeddings: &'a EmbeddingCache,
    pub vectors: &'a VectorStoreAdapter,
    pub limits: QuotaLimits,
    pub data_dir: &'a Path,
    pub workers: usize,
}

/// Ingest a batch of documents into one project.
#[must_use]
pub fn ingest_batch(
    handle: &ProjectHandle,
    deps: &IngestDeps<'_>,
    items: Vec<IngestItem>,
) -> IngestResponse {
    let workers = deps.workers.clamp(1, items.len().max(1));
    let outcomes: Mutex<Vec<Option<IngestItemOutcome>>> = Mutex::new(vec![None; items.len()]);
    let queue: Mutex<std::vec::IntoIter<(usize, IngestItem)>> =
        Mutex::new(items.into_iter().enumerate().collect::<Vec<_>>().into_iter());

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                loop {
                    let next = {
                        let mut queue = queue
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        queue.next()
                    };
                    let Some((index, item)) = next else { break };
                    let outcome = ingest_one(handle, deps, item);
                    let mut slots = outcomes
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    slots[index] = Some(outcome);
                }
            });
        }
    });

    let outcomes = outcomes
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .into_iter()
        .flatten()
        .collect();
    IngestResponse::from_outcomes(outcomes)
}

/// Run the pipeline for one document and fold any failure into its outcome.
fn ingest_one(handle: &ProjectHandle, deps: &IngestDeps<'_>, item: IngestItem) -> IngestItemOutcome {
    let doc_id = item
        .doc_id
        .clone()
        .unwrap_or_else(|| handle.generate_doc_id());

    match ingest_document(handle, deps, &doc_id, item) {
        Ok(chunks) => {
            let metrics = knowledgebeast_core::global_metrics();
            metrics.ingest.documents_total.inc();
            metrics.ingest.chunks_total.add(chunks as u64);
            IngestItemOutcome {
                doc_id,
                ok: true,
                chunks,
                error: None,
                error_type: None,
            }
        }
        Err(e) => {
            knowledgebeast_core::global_metrics()
                .ingest
                .document_failures_total
                .inc();
            tracing::warn!(doc_id = %doc_id, error = %e, "document ingest failed");
            IngestItemOutcome {
                doc_id,
                ok: false,
                chunks: 0,
                error: Some(e.to_string()),
                error_type: Some(e.error_type().to_string()),
            }
        }
    }
}

fn ingest_document(
    handle: &ProjectHandle,
    deps: &IngestDeps<'_>,
    doc_id: &str,
    item: IngestItem,
) -> KbResult<usize> {
    validate_doc_id(doc_id)?;

    let (raw, source, content_type) = resolve_content(deps.data_dir, &item)?;
    let text = parse_content(content_type, &raw);
    if text.trim().is_empty() {
        return Err(KbError::InvalidArgument(format!(
            "document {doc_id} has no textual content"
        )));
    }

    deps.limits.check_admission(
        handle.chunks.doc_count(),
        handle.chunks.total_bytes(),
        text.len() as u64,
        handle.chunks.contains_document(doc_id),
    )?;

    let pieces = deps.chunker.chunk(&text).map_err(KbError::from)?;
    if pieces.is_empty() {
        return Err(KbError::InvalidArgument(format!(
            "document {doc_id} produced no chunks"
        )));
    }

    let texts: Vec<&str> = pieces.iter().map(|p| p.text.as_str()).collect();
    let vectors = deps
        .embeddings
        .get_or_embed_batch(deps.embedder, &texts)
        .map_err(KbError::from)?;

    let mut chunks = Vec::with_capacity(pieces.len());
    let mut records = Vec::with_capacity(pieces.len());
    for (piece, vector) in pieces.into_iter().zip(vectors) {
        let chunk_id = Chunk::derive_id(doc_id, piece.ordinal);
        records.push(VectorRecord {
            chunk_id: chunk_id.clone(),
            doc_id: doc_id.to_string(),
            vector: vector.clone(),
            metadata: filterable_metadata(&item.metadata),
        });
        chunks.push(Chunk {
            chunk_id,
            doc_id: doc_id.to_string(),
            ordinal: piece.ordinal,
            text: piece.text,
            token_count: piece.token_count,
            vector: Some(vector),
            metadata: item.metadata.clone(),
        });
    }
    let chunk_count = chunks.len();

    // Same-doc_id ingests serialize here; queries see the old document until
    // the full replacement is published.
    let write_guard = handle
        .write_lock
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    deps.vectors
        .upsert(&handle.project_id, &records)
        .map_err(KbError::from)?;

    // Local index update, with vector rollback if it cannot complete.
    let local = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handle.chunks.upsert_document(doc_id, chunks);
        handle.keyword.upsert_document(
            doc_id,
            &handle
                .chunks
                .document_chunks(doc_id)
                .into_iter()
                .map(|c| (c.chunk_id, c.text))
                .collect::<Vec<_>>(),
        );
    }));
    if local.is_err() {
        knowledgebeast_core::global_metrics().ingest.rollbacks_total.inc();
        if let Err(rollback) = deps.vectors.delete_by_doc(&handle.project_id, doc_id) {
            tracing::error!(
                doc_id,
                error = %rollback,
                "vector rollback failed after keyword update failure"
            );
        }
        drop(write_guard);
        return Err(KbError::Internal(format!(
            "keyword index update failed for {doc_id}; vector writes rolled back"
        )));
    }
    drop(write_guard);

    handle.register_document(DocumentMeta {
        doc_id: doc_id.to_string(),
        source,
        content_type,
        created_at: now_micros(),
        metadata: item.metadata,
    });
    Ok(chunk_count)
}

/// Delete one document from every store. Inverse of a successful ingest.
pub fn delete_document(
    handle: &ProjectHandle,
    vectors: &VectorStoreAdapter,
    doc_id: &str,
) -> KbResult<()> {
    if handle.document_meta(doc_id).is_none() && !handle.chunks.contains_document(doc_id) {
        return Err(KbError::not_found("document", doc_id));
    }
    let _write_guard = handle
        .write_lock
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    vectors
        .delete_by_doc(&handle.project_id, doc_id)
        .map_err(KbError::from)?;
    handle.keyword.remove_document(doc_id);
    handle.chunks.remove_document(doc_id);
    handle.unregister_document(doc_id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Content resolution and parsing
// ---------------------------------------------------------------------------

fn validate_doc_id(doc_id: &str) -> KbResult<()> {
    if doc_id.is_empty() || doc_id.len() > 200 {
        return Err(KbError::InvalidArgument(
            "doc_id must be 1..=200 characters".into(),
        ));
    }
    // '#' is the chunk-ordinal separator and cannot appear in doc ids.
    if doc_id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(KbError::InvalidArgument(format!(
            "doc_id {doc_id:?} may only contain alphanumerics, '-', '_', '.'"
        )));
    }
    Ok(())
}

/// Resolve the document's raw text and provenance.
fn resolve_content(
    data_dir: &Path,
    item: &IngestItem,
) -> KbResult<(String, String, ContentType)> {
    match (&item.content, &item.path) {
        (Some(_), Some(_)) => Err(KbError::InvalidArgument(
            "provide either content or path, not both".into(),
        )),
        (None, None) => Err(KbError::InvalidArgument(
            "one of content or path is required".into(),
        )),
        (Some(content), None) => {
            let content_type = declared_content_type(item)?.unwrap_or_default();
            Ok((content.clone(), "inline".to_string(), content_type))
        }
        (None, Some(path)) => {
            let resolved = jail_path(data_dir, path)?;
            let raw = std::fs::read_to_string(&resolved).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    KbError::not_found("document source", path.clone())
                } else {
                    KbError::Io(e)
                }
            })?;
            let content_type =
                declared_content_type(item)?.unwrap_or_else(|| ContentType::from_path(path));
            Ok((raw, path.clone(), content_type))
        }
    }
}

fn declared_content_type(item: &IngestItem) -> KbResult<Option<ContentType>> {
    match &item.content_type {
        None => Ok(None),
        Some(label) => ContentType::from_label(label).map(Some).ok_or_else(|| {
            KbError::InvalidArgument(format!("unsupported content type: {label:?}"))
        }),
    }
}

/// Confine a client-supplied path to the data dir. Rejects absolute paths
/// and any traversal component.
fn jail_path(data_dir: &Path, relative: &str) -> KbResult<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(KbError::InvalidArgument(
            "path must be relative to the data dir".into(),
        ));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(KbError::InvalidArgument(format!(
                    "path {relative:?} escapes the data dir"
                )));
            }
        }
    }
    Ok(data_dir.join(candidate))
}

/// Reduce raw content to plain indexable text.
#[must_use]
pub fn parse_content(content_type: ContentType, raw: &str) -> String {
    match content_type {
        ContentType::Markdown => strip_markdown(raw),
        ContentType::Html => strip_html(raw),
        ContentType::Text => raw.to_string(),
    }
}

/// Strip GFM Markdown formatting to plain text: code fences, headers,
/// emphasis, links, images, blockquotes, list markers, inline HTML.
#[must_use]
pub fn strip_markdown(input: &str) -> String {
    static RE_CODE_FENCE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?ms)^```[^\n]*\n(.*?)^```[ \t]*$").unwrap());
    static RE_INLINE_CODE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"`([^`]*)`").unwrap());
    static RE_IMAGE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
    static RE_LINK: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
    static RE_HEADER: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?m)^#{1,6}[ \t]+").unwrap());
    static RE_EMPHASIS: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(\*{1,3}|_{1,3})([^*_]+)\1").unwrap());
    static RE_BLOCKQUOTE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?m)^[ \t]*>[ \t]?").unwrap());
    static RE_LIST_MARKER: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?m)^[ \t]*(?:[-*+]|\d+\.)[ \t]+").unwrap());
    static RE_HRULE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?m)^[ \t]*(?:-{3,}|\*{3,}|_{3,})[ \t]*$").unwrap());

    let mut text = RE_CODE_FENCE.replace_all(input, "$1").into_owned();
    text = RE_INLINE_CODE.replace_all(&text, "$1").into_owned();
    text = RE_IMAGE.replace_all(&text, "$1").into_owned();
    text = RE_LINK.replace_all(&text, "$1").into_owned();
    text = RE_HEADER.replace_all(&text, "").into_owned();
    text = RE_EMPHASIS.replace_all(&text, "$2").into_owned();
    text = RE_BLOCKQUOTE.replace_all(&text, "").into_owned();
    text = RE_LIST_MARKER.replace_all(&text, "").into_owned();
    text = RE_HRULE.replace_all(&text, "").into_owned();
    strip_html(&text)
}

/// Drop HTML tags and script/style bodies, decode the common entities.
#[must_use]
pub fn strip_html(input: &str) -> String {
    static RE_SCRIPT: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap()
    });
    static RE_TAG: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"<[^>]+>").unwrap());

    let text = RE_SCRIPT.replace_all(input, " ");
    let text = RE_TAG.replace_all(&text, " ");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Flatten JSON metadata to the string form used for backend-side filtering.
fn filterable_metadata(
    metadata: &HashMap<String, serde_json::Value>,
) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}
