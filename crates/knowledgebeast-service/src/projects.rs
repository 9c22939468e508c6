//! Project manager: tenant CRUD, API keys, isolation, and the delete
//! discipline.
//!
//! The manager exclusively owns project records and their in-process child
//! state (keyword index, chunk store, semantic cache, limiters). Other
//! components never hold long-lived references to a project's mutable state;
//! they borrow a [`ProjectHandle`] per operation.
//!
//! Handles are process-local singletons per project, created on demand under
//! the manager's map lock. Lock order is fixed: manager map first, then any
//! per-handle lock; cache locks are leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use asupersync::{Cx, Outcome};
use sha2::{Digest, Sha256};

use knowledgebeast_core::{
    ApiKeyRecord, ApiKeyScope, Config, DocumentMeta, KbError, KbResult, Project, ProjectState,
    now_micros,
};
use knowledgebeast_db::{ApiKeyRow, DbPool, ProjectRow, queries};
use knowledgebeast_search_core::{
    ChunkStore, KeywordIndex, SemanticCacheConfig, SemanticQueryCache, VectorStoreAdapter,
};

use crate::quota::{InflightLimiter, QuotaLimits, RateLimiter};

/// Prefix of every issued API key (`kb_<key_id>_<secret>`).
const API_KEY_PREFIX: &str = "kb";

/// Convert a `db` Outcome into a `KbResult`, translating cancellation into
/// the timeout kind the facade reports.
pub(crate) fn db_result<T>(out: Outcome<T, knowledgebeast_db::DbError>) -> KbResult<T> {
    match out {
        Outcome::Ok(v) => Ok(v),
        Outcome::Err(e) => Err(e.into()),
        Outcome::Cancelled(_) => Err(KbError::Timeout("database operation cancelled".into())),
        Outcome::Panicked(p) => Err(KbError::Internal(format!("database task panicked: {p:?}"))),
    }
}

/// Per-project in-process state. One instance per live project, owned by the
/// manager's handle map.
pub struct ProjectHandle {
    pub project_id: String,
    pub keyword: KeywordIndex,
    pub chunks: ChunkStore,
    pub semantic: SemanticQueryCache,
    pub inflight: Arc<InflightLimiter>,
    pub rate: RateLimiter,
    /// Serializes same-project writes so concurrent ingests of one `doc_id`
    /// replace atomically.
    pub write_lock: Mutex<()>,
    /// Document registry (metadata only; chunk text lives in `chunks`).
    pub docs: RwLock<HashMap<String, DocumentMeta>>,
    /// Monotone counter folded into generated doc ids.
    doc_counter: AtomicU64,
}

impl ProjectHandle {
    fn new(project_id: String, config: &Config) -> KbResult<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let hit_threshold = config.semantic_cache_threshold as f32;
        let semantic = SemanticQueryCache::new(SemanticCacheConfig {
            capacity: config.cache_size_query,
            hit_threshold,
            ttl: Duration::from_secs(config.semantic_cache_ttl_seconds),
        })
        .map_err(KbError::from)?;
        Ok(Self {
            project_id,
            keyword: KeywordIndex::default(),
            chunks: ChunkStore::new(),
            semantic,
            inflight: Arc::new(InflightLimiter::new(config.per_project_max_inflight)),
            rate: RateLimiter::new(config.per_project_rate_limit),
            write_lock: Mutex::new(()),
            docs: RwLock::new(HashMap::new()),
            doc_counter: AtomicU64::new(0),
        })
    }

    /// Generate a doc id unique within this project even when ingest exceeds
    /// one document per millisecond: the per-project counter disambiguates
    /// same-millisecond ids.
    #[must_use]
    pub fn generate_doc_id(&self) -> String {
        let millis = now_micros() / 1_000;
        let counter = self.doc_counter.fetch_add(1, Ordering::Relaxed);
        format!("doc-{millis}-{counter}")
    }

    /// Record document metadata after a successful ingest.
    pub fn register_document(&self, meta: DocumentMeta) {
        let mut docs = self
            .docs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        docs.insert(meta.doc_id.clone(), meta);
    }

    /// Forget a document's metadata.
    pub fn unregister_document(&self, doc_id: &str) {
        let mut docs = self
            .docs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        docs.remove(doc_id);
    }

    #[must_use]
    pub fn document_meta(&self, doc_id: &str) -> Option<DocumentMeta> {
        let docs = self
            .docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        docs.get(doc_id).cloned()
    }
}

/// The project manager. See the module docs for ownership rules.
pub struct ProjectManager {
    config: Config,
    pool: DbPool,
    vectors: Arc<VectorStoreAdapter>,
    handles: Mutex<HashMap<String, Arc<ProjectHandle>>>,
    /// Folded into generated identifiers to keep them unique within the
    /// process even at identical timestamps.
    id_counter: AtomicU64,
}

impl ProjectManager {
    #[must_use]
    pub fn new(config: Config, pool: DbPool, vectors: Arc<VectorStoreAdapter>) -> Self {
        Self {
            config,
            pool,
            vectors,
            handles: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            max_documents: self.config.quota_max_documents,
            max_bytes: self.config.quota_max_bytes,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[must_use]
    pub fn vectors(&self) -> &Arc<VectorStoreAdapter> {
        &self.vectors
    }

    // ── Identity helpers ───────────────────────────────────────────────

    fn slugify(name: &str) -> String {
        let mut slug = String::with_capacity(name.len());
        let mut last_dash = true;
        for ch in name.chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch.to_ascii_lowercase());
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        if slug.is_empty() {
            slug.push_str("project");
        }
        slug.truncate(40);
        slug
    }

    fn short_hash(&self, seed: &str) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(now_micros().to_le_bytes());
        hasher.update(counter.to_le_bytes());
        hex::encode(&hasher.finalize()[..6])
    }

    /// Generate an opaque URL-safe project id from the name.
    fn generate_project_id(&self, name: &str) -> String {
        format!("{}-{}", Self::slugify(name), self.short_hash(name))
    }

    // ── Project CRUD ───────────────────────────────────────────────────

    /// Create a project. Duplicate names are a *Conflict*.
    pub async fn create_project(
        &self,
        cx: &Cx,
        name: &str,
        description: &str,
        metadata: HashMap<String, serde_json::Value>,
        embedding_model_id: Option<&str>,
    ) -> KbResult<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KbError::InvalidArgument("project name must not be empty".into()));
        }

        let mut row = ProjectRow::new(
            self.generate_project_id(name),
            name.to_string(),
            description.to_string(),
            embedding_model_id
                .unwrap_or(&self.config.embedding_model_id)
                .to_string(),
        );
        row.metadata_json = serde_json::to_string(&metadata)?;

        let created = db_result(queries::create_project(cx, &self.pool, &row).await)?;
        tracing::info!(project_id = %created.id, name, "project created");
        created.into_project().map_err(KbError::from)
    }

    /// Fetch a project by id.
    pub async fn get_project(&self, cx: &Cx, project_id: &str) -> KbResult<Project> {
        let row = db_result(queries::get_project(cx, &self.pool, project_id).await)?;
        row.into_project().map_err(KbError::from)
    }

    /// List all projects.
    pub async fn list_projects(&self, cx: &Cx) -> KbResult<Vec<Project>> {
        let rows = db_result(queries::list_projects(cx, &self.pool).await)?;
        rows.into_iter()
            .map(|r| r.into_project().map_err(KbError::from))
            .collect()
    }

    /// Update description/metadata.
    pub async fn update_project(
        &self,
        cx: &Cx,
        project_id: &str,
        description: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> KbResult<Project> {
        let metadata_json = match metadata {
            Some(m) => Some(serde_json::to_string(&m)?),
            None => None,
        };
        let row = db_result(
            queries::update_project(cx, &self.pool, project_id, description, metadata_json.as_deref())
                .await,
        )?;
        row.into_project().map_err(KbError::from)
    }

    /// Resolve a project that must be in the `active` state, together with
    /// its handle. Queries and ingests route through here.
    pub async fn resolve_active(
        &self,
        cx: &Cx,
        project_id: &str,
    ) -> KbResult<(Project, Arc<ProjectHandle>)> {
        let project = self.get_project(cx, project_id).await?;
        if project.state == ProjectState::Deleting {
            return Err(KbError::Conflict(format!(
                "project {project_id} is being deleted"
            )));
        }
        let handle = self.handle_for(project_id)?;
        Ok((project, handle))
    }

    /// Clone out all live handles (for the cache sweeper).
    #[must_use]
    pub fn handles_snapshot(&self) -> Vec<Arc<ProjectHandle>> {
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handles.values().cloned().collect()
    }

    /// Get or create the process-local handle for a project.
    pub fn handle_for(&self, project_id: &str) -> KbResult<Arc<ProjectHandle>> {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = handles.get(project_id) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(ProjectHandle::new(project_id.to_string(), &self.config)?);
        handles.insert(project_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Delete a project and all its children.
    ///
    /// Sequence: mark `deleting` → tear down collection, indexes, caches,
    /// keys → delete the record. If the vector collection cannot be torn
    /// down, the record stays in `deleting` and the call returns
    /// *PartialDelete*; a retry resumes from the top. Deleting an unknown
    /// project succeeds (idempotence).
    pub async fn delete_project(&self, cx: &Cx, project_id: &str) -> KbResult<()> {
        match self.get_project(cx, project_id).await {
            Ok(_) => {}
            Err(KbError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        db_result(
            queries::set_project_state(cx, &self.pool, project_id, &ProjectState::Deleting.to_string())
                .await,
        )?;

        // External teardown first: the record must outlive its children so a
        // failed teardown can be resumed instead of leaking orphaned data.
        if let Err(e) = self.vectors.delete_collection(project_id) {
            tracing::warn!(
                project_id,
                error = %e,
                "vector collection teardown failed; project left in deleting state"
            );
            return Err(KbError::PartialDelete(project_id.to_string()));
        }

        // In-process children.
        let handle = {
            let mut handles = self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            handles.remove(project_id)
        };
        if let Some(handle) = handle {
            handle.keyword.clear();
            handle.chunks.clear();
            handle.semantic.clear();
        }

        // Record last (also purges API keys).
        db_result(queries::delete_project_record(cx, &self.pool, project_id).await)?;
        tracing::info!(project_id, "project deleted");
        Ok(())
    }

    /// Re-create a project record from an archive, preserving its identity.
    pub async fn restore_project(&self, cx: &Cx, project: &Project) -> KbResult<Project> {
        let row = ProjectRow {
            id: project.id.clone(),
            name: project.name.clone(),
            description: project.description.clone(),
            embedding_model_id: project.embedding_model_id.clone(),
            created_at: project.created_at,
            updated_at: now_micros(),
            metadata_json: serde_json::to_string(&project.metadata)?,
            state: ProjectState::Active.to_string(),
        };
        let created = db_result(queries::create_project(cx, &self.pool, &row).await)?;
        created.into_project().map_err(KbError::from)
    }

    // ── API keys ───────────────────────────────────────────────────────

    /// Issue a new API key. The plaintext is returned exactly once.
    pub async fn create_api_key(
        &self,
        cx: &Cx,
        project_id: &str,
        scopes: &[ApiKeyScope],
        expires_at: Option<i64>,
    ) -> KbResult<(ApiKeyRecord, String)> {
        if scopes.is_empty() {
            return Err(KbError::InvalidArgument(
                "an API key needs at least one scope".into(),
            ));
        }
        // The project must exist; keys for ghosts would be unrevocable.
        let _ = self.get_project(cx, project_id).await?;

        let key_id = format!("k{}", self.short_hash(project_id));
        let secret = {
            let mut hasher = Sha256::new();
            hasher.update(project_id.as_bytes());
            hasher.update(now_micros().to_le_bytes());
            hasher.update(self.id_counter.fetch_add(1, Ordering::Relaxed).to_le_bytes());
            hex::encode(hasher.finalize())
        };
        let salt = self.short_hash(&key_id);
        let row = ApiKeyRow {
            key_id: key_id.clone(),
            project_id: project_id.to_string(),
            hash: hash_secret(&salt, &secret),
            salt,
            scopes: ApiKeyRow::encode_scopes(scopes),
            expires_at,
            last_used_at: None,
            revoked: 0,
            created_at: now_micros(),
        };
        db_result(queries::insert_api_key(cx, &self.pool, &row).await)?;

        let plaintext = format!("{API_KEY_PREFIX}_{key_id}_{secret}");
        let record = row.into_record()?;
        tracing::info!(project_id, key_id = %record.key_id, "api key issued");
        Ok((record, plaintext))
    }

    /// List a project's keys (no secret material).
    pub async fn list_api_keys(&self, cx: &Cx, project_id: &str) -> KbResult<Vec<ApiKeyRecord>> {
        let rows = db_result(queries::list_api_keys(cx, &self.pool, project_id).await)?;
        rows.into_iter()
            .map(|r| r.into_record().map_err(KbError::from))
            .collect()
    }

    /// Revoke a key. Unknown ids are *NotFound*.
    pub async fn revoke_api_key(&self, cx: &Cx, project_id: &str, key_id: &str) -> KbResult<()> {
        let row = db_result(queries::get_api_key(cx, &self.pool, key_id).await)?;
        if row.project_id != project_id {
            return Err(KbError::not_found("api key", key_id));
        }
        db_result(queries::revoke_api_key(cx, &self.pool, key_id).await)?;
        tracing::info!(project_id, key_id, "api key revoked");
        Ok(())
    }

    /// Validate an `X-API-Key` value against a project and required scope.
    ///
    /// Missing/garbled/unknown/revoked/expired keys are *Unauthenticated*;
    /// a valid key for the wrong project or with insufficient scope is
    /// *Forbidden*. Also enforces the per-`(key, project)` rate limit.
    pub async fn authenticate(
        &self,
        cx: &Cx,
        presented: &str,
        project_id: &str,
        required: ApiKeyScope,
    ) -> KbResult<ApiKeyRecord> {
        let (key_id, secret) = parse_api_key(presented)
            .ok_or_else(|| KbError::Unauthenticated("malformed API key".into()))?;

        let row = match queries::get_api_key(cx, &self.pool, key_id).await {
            Outcome::Ok(row) => row,
            Outcome::Err(knowledgebeast_db::DbError::NotFound { .. }) => {
                return Err(KbError::Unauthenticated("unknown API key".into()));
            }
            other => db_result(other)?,
        };

        if hash_secret(&row.salt, secret) != row.hash {
            return Err(KbError::Unauthenticated("invalid API key".into()));
        }
        if row.is_revoked() {
            return Err(KbError::Unauthenticated("API key revoked".into()));
        }
        if let Some(expires_at) = row.expires_at
            && expires_at <= now_micros()
        {
            return Err(KbError::Unauthenticated("API key expired".into()));
        }
        if row.project_id != project_id {
            return Err(KbError::Forbidden(
                "API key is bound to a different project".into(),
            ));
        }

        let record = row.into_record()?;
        if !record.authorizes(required, now_micros()) {
            return Err(KbError::Forbidden(format!(
                "API key lacks the {required} scope"
            )));
        }

        // Rate limit per (key, project).
        let handle = self.handle_for(project_id)?;
        handle.rate.consume(&format!("{}:{}", record.key_id, project_id))?;

        // last_used_at is best-effort bookkeeping.
        if let Outcome::Err(e) = queries::touch_api_key(cx, &self.pool, &record.key_id).await {
            tracing::debug!(key_id = record.key_id, error = %e, "last_used_at update failed");
        }
        Ok(record)
    }
}

fn hash_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `kb_<key_id>_<secret>` into its parts.
fn parse_api_key(presented: &str) -> Option<(&str, &str)> {
    let rest = presented.strip_prefix("kb_")?;
    let (key_id, secret) = rest.split_once('_')?;
    if key_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((key_id, secret))
}
