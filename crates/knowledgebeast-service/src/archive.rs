//! Project export/import.
//!
//! An archive is a self-contained JSON document: the project record plus
//! every document's metadata and chunks (vectors included). Importing into a
//! fresh instance rebuilds the vector collection and keyword index from the
//! archived chunks without re-running the embedding model, so an exported
//! and re-imported project answers queries with equal result sets.

use asupersync::Cx;
use serde::{Deserialize, Serialize};

use knowledgebeast_core::{Chunk, DocumentMeta, KbError, KbResult, Project};
use knowledgebeast_search_core::{VectorRecord, VectorStoreAdapter};

use crate::projects::ProjectManager;

/// Current archive format version.
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// One document with its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentArchive {
    pub meta: DocumentMeta,
    pub chunks: Vec<Chunk>,
}

/// A complete project snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectArchive {
    pub format_version: u32,
    pub project: Project,
    pub documents: Vec<DocumentArchive>,
}

/// Export a project to an archive. Documents are ordered by id so repeated
/// exports of the same state are byte-identical.
pub async fn export_project(
    cx: &Cx,
    manager: &ProjectManager,
    project_id: &str,
) -> KbResult<ProjectArchive> {
    let (project, handle) = manager.resolve_active(cx, project_id).await?;

    let mut documents = Vec::new();
    for doc_id in handle.chunks.doc_ids() {
        let chunks = handle.chunks.document_chunks(&doc_id);
        let meta = handle.document_meta(&doc_id).unwrap_or_else(|| DocumentMeta {
            doc_id: doc_id.clone(),
            source: "inline".to_string(),
            content_type: knowledgebeast_core::ContentType::Text,
            created_at: project.created_at,
            metadata: std::collections::HashMap::new(),
        });
        documents.push(DocumentArchive { meta, chunks });
    }

    Ok(ProjectArchive {
        format_version: ARCHIVE_FORMAT_VERSION,
        project,
        documents,
    })
}

/// Import an archive as a new project, preserving its id and name.
///
/// Fails with *Conflict* when a project with the same name already exists.
pub async fn import_project(
    cx: &Cx,
    manager: &ProjectManager,
    vectors: &VectorStoreAdapter,
    archive: ProjectArchive,
) -> KbResult<Project> {
    if archive.format_version != ARCHIVE_FORMAT_VERSION {
        return Err(KbError::InvalidArgument(format!(
            "unsupported archive format version {}",
            archive.format_version
        )));
    }

    let project = manager.restore_project(cx, &archive.project).await?;
    let handle = manager.handle_for(&project.id)?;

    for document in archive.documents {
        let doc_id = document.meta.doc_id.clone();
        let records: Vec<VectorRecord> = document
            .chunks
            .iter()
            .filter_map(|chunk| {
                chunk.vector.as_ref().map(|vector| VectorRecord {
                    chunk_id: chunk.chunk_id.clone(),
                    doc_id: doc_id.clone(),
                    vector: vector.clone(),
                    metadata: chunk
                        .metadata
                        .iter()
                        .map(|(k, v)| {
                            let s = match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), s)
                        })
                        .collect(),
                })
            })
            .collect();

        let _write_guard = handle
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        vectors
            .upsert(&project.id, &records)
            .map_err(KbError::from)?;
        let keyword_chunks: Vec<(String, String)> = document
            .chunks
            .iter()
            .map(|c| (c.chunk_id.clone(), c.text.clone()))
            .collect();
        handle.chunks.upsert_document(&doc_id, document.chunks);
        handle.keyword.upsert_document(&doc_id, &keyword_chunks);
        handle.register_document(document.meta);
    }

    tracing::info!(project_id = %project.id, "project imported from archive");
    Ok(project)
}
