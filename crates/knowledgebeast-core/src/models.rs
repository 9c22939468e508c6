//! Domain models for KnowledgeBeast.
//!
//! These are the wire- and engine-facing types shared by every crate:
//! projects, documents, chunks, API keys, query requests/responses, ingest
//! batches, and health reports. Persistence rows live in the db crate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KbError;

// =============================================================================
// Project
// =============================================================================

/// Lifecycle state of a project record.
///
/// `Deleting` is entered when a delete begins and only leaves via a completed
/// (possibly resumed) delete. Queries and ingests against a `Deleting`
/// project are rejected with *Conflict*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Active,
    Deleting,
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

impl FromStr for ProjectState {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "deleting" => Ok(Self::Deleting),
            other => Err(KbError::Internal(format!(
                "unknown project state in store: {other:?}"
            ))),
        }
    }
}

/// A tenant project: the unit of isolation.
///
/// Owns exactly one vector collection, one keyword index, one semantic query
/// cache. Documents ingested under one project are never visible to queries
/// scoped to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Opaque, globally unique, URL-safe identifier.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Embedding model this project's vectors were produced with.
    pub embedding_model_id: String,
    /// Microseconds since Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
    pub state: ProjectState,
    /// Free-form client metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

// =============================================================================
// Documents and chunks
// =============================================================================

/// Content types the ingest pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Markdown,
    Html,
    #[default]
    Text,
}

impl ContentType {
    /// Parse a client-supplied label (MIME type or short name).
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" | "text/markdown" => Some(Self::Markdown),
            "html" | "htm" | "text/html" => Some(Self::Html),
            "text" | "txt" | "plain" | "text/plain" => Some(Self::Text),
            _ => None,
        }
    }

    /// Infer from a file extension; unknown extensions fall back to `Text`.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit('.').next().unwrap_or("");
        Self::from_label(ext).unwrap_or(Self::Text)
    }
}

/// Metadata for an ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Unique within its project.
    pub doc_id: String,
    /// Origin: a path under the data dir, or `"inline"`.
    pub source: String,
    pub content_type: ContentType,
    /// Microseconds since Unix epoch.
    pub created_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// The unit stored and retrieved: an embedded, indexable passage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Derived from `(doc_id, ordinal)`; unique within the project.
    pub chunk_id: String,
    pub doc_id: String,
    /// 0-based position within the document.
    pub ordinal: u32,
    pub text: String,
    pub token_count: usize,
    /// Fixed-dimension embedding. `None` until the embedding stage runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    /// Inherited document metadata plus chunk-level additions.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Chunk {
    /// Derive the canonical chunk id for `(doc_id, ordinal)`.
    ///
    /// Zero-padded so that lexicographic ordering of ids from the same
    /// document matches ordinal ordering.
    #[must_use]
    pub fn derive_id(doc_id: &str, ordinal: u32) -> String {
        format!("{doc_id}#{ordinal:04}")
    }
}

// =============================================================================
// API keys
// =============================================================================

/// Permission scope attached to an API key.
///
/// `Admin` implies `Read` and `Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyScope {
    Read,
    Write,
    Admin,
}

impl ApiKeyScope {
    /// Whether a key holding `self` satisfies a requirement of `required`.
    #[must_use]
    pub const fn satisfies(self, required: Self) -> bool {
        match (self, required) {
            (Self::Admin, _) => true,
            (Self::Read, Self::Read) | (Self::Write, Self::Write) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ApiKeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for ApiKeyScope {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(KbError::InvalidArgument(format!(
                "unknown API key scope: {other:?} (expected read, write, or admin)"
            ))),
        }
    }
}

/// Wire-facing API key record. The secret and its hash never appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub project_id: String,
    pub scopes: Vec<ApiKeyScope>,
    /// Microseconds since Unix epoch, if an expiry was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    pub revoked: bool,
    pub created_at: i64,
}

impl ApiKeyRecord {
    /// Whether this key grants `required` scope right now.
    #[must_use]
    pub fn authorizes(&self, required: ApiKeyScope, now_micros: i64) -> bool {
        if self.revoked {
            return false;
        }
        if let Some(exp) = self.expires_at
            && exp <= now_micros
        {
            return false;
        }
        self.scopes.iter().any(|s| s.satisfies(required))
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Retrieval mode for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Vector,
    Keyword,
    #[default]
    Hybrid,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector => write!(f, "vector"),
            Self::Keyword => write!(f, "keyword"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for QueryMode {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(Self::Vector),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(KbError::InvalidArgument(format!(
                "unknown query mode: {other:?} (expected vector, keyword, or hybrid)"
            ))),
        }
    }
}

fn default_top_k() -> usize {
    10
}

/// A search request against a single project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub mode: QueryMode,
    /// Re-rank the top candidates with the cross-encoder.
    #[serde(default)]
    pub rerank: bool,
    /// MMR diversification strength in `[0, 1]`; `None` disables MMR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmr_lambda: Option<f32>,
    /// Exact-match metadata filter applied to candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<HashMap<String, String>>,
}

impl QueryRequest {
    /// Minimal request with defaults for everything but the query text.
    #[must_use]
    pub fn simple(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: default_top_k(),
            mode: QueryMode::default(),
            rerank: false,
            mmr_lambda: None,
            filter: None,
        }
    }
}

/// A single ranked passage in a query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultItem {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    /// Final score after fusion / rerank / MMR.
    pub score: f32,
    /// Normalized vector-stream component, when that stream contributed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    /// Normalized keyword-stream component, when that stream contributed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Response for a completed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResultItem>,
    pub mode: QueryMode,
    /// True when the vector stream was unavailable and keyword-only results
    /// were served in its place.
    pub degraded: bool,
    /// True when cross-encoder scores replaced the fused scores.
    pub reranked: bool,
    /// True when the semantic query cache answered without running the
    /// retrieval pipeline.
    pub cache_hit: bool,
    pub took_ms: u64,
}

// =============================================================================
// Ingest
// =============================================================================

/// One document in an ingest batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestItem {
    /// Client-supplied id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// Inline content. Exactly one of `content` / `path` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Path relative to the data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Content type label; inferred from the path when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-document outcome within an ingest batch.
///
/// A failed document never fails the batch; callers inspect outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestItemOutcome {
    pub doc_id: String,
    pub ok: bool,
    /// Number of chunks written (0 on failure).
    pub chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// Response for an ingest batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub outcomes: Vec<IngestItemOutcome>,
    pub accepted: usize,
    pub failed: usize,
}

impl IngestResponse {
    /// Assemble a response from per-document outcomes.
    #[must_use]
    pub fn from_outcomes(outcomes: Vec<IngestItemOutcome>) -> Self {
        let accepted = outcomes.iter().filter(|o| o.ok).count();
        let failed = outcomes.len() - accepted;
        Self {
            outcomes,
            accepted,
            failed,
        }
    }
}

// =============================================================================
// Health
// =============================================================================

/// Aggregated health level; ordered worst-last so `max` aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Probe result for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregated health report: worst component wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    /// Aggregate component probes; an empty probe list is healthy.
    #[must_use]
    pub fn aggregate(components: Vec<ComponentHealth>) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { status, components }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_stable_and_ordered() {
        let a = Chunk::derive_id("doc-1", 0);
        let b = Chunk::derive_id("doc-1", 1);
        let c = Chunk::derive_id("doc-1", 12);
        assert_eq!(a, "doc-1#0000");
        assert!(a < b && b < c);
    }

    #[test]
    fn admin_scope_satisfies_everything() {
        assert!(ApiKeyScope::Admin.satisfies(ApiKeyScope::Read));
        assert!(ApiKeyScope::Admin.satisfies(ApiKeyScope::Write));
        assert!(ApiKeyScope::Admin.satisfies(ApiKeyScope::Admin));
        assert!(!ApiKeyScope::Read.satisfies(ApiKeyScope::Write));
        assert!(!ApiKeyScope::Write.satisfies(ApiKeyScope::Admin));
    }

    #[test]
    fn revoked_and_expired_keys_do_not_authorize() {
        let mut key = ApiKeyRecord {
            key_id: "k1".into(),
            project_id: "p1".into(),
            scopes: vec![ApiKeyScope::Read],
            expires_at: None,
            last_used_at: None,
            revoked: false,
            created_at: 0,
        };
        assert!(key.authorizes(ApiKeyScope::Read, 100));

        key.revoked = true;
        assert!(!key.authorizes(ApiKeyScope::Read, 100));

        key.revoked = false;
        key.expires_at = Some(50);
        assert!(!key.authorizes(ApiKeyScope::Read, 100));
        assert!(key.authorizes(ApiKeyScope::Read, 49));
    }

    #[test]
    fn query_mode_parses_known_and_rejects_unknown() {
        assert_eq!("hybrid".parse::<QueryMode>().unwrap(), QueryMode::Hybrid);
        assert_eq!("VECTOR".parse::<QueryMode>().unwrap(), QueryMode::Vector);
        let err = "cosmic".parse::<QueryMode>().unwrap_err();
        assert_eq!(err.error_type(), "INVALID_ARGUMENT");
    }

    #[test]
    fn health_aggregation_takes_the_worst_component() {
        let report = HealthReport::aggregate(vec![
            ComponentHealth {
                name: "store".into(),
                status: HealthStatus::Healthy,
                detail: None,
            },
            ComponentHealth {
                name: "vector_backend".into(),
                status: HealthStatus::Degraded,
                detail: Some("circuit open".into()),
            },
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn ingest_response_counts_outcomes() {
        let resp = IngestResponse::from_outcomes(vec![
            IngestItemOutcome {
                doc_id: "a".into(),
                ok: true,
                chunks: 3,
                error: None,
                error_type: None,
            },
            IngestItemOutcome {
                doc_id: "b".into(),
                ok: false,
                chunks: 0,
                error: Some("boom".into()),
                error_type: Some("INTERNAL".into()),
            },
        ]);
        assert_eq!(resp.accepted, 1);
        assert_eq!(resp.failed, 1);
    }
}
