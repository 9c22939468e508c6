//! The serving facade: every public operation of the knowledge base.
//!
//! [`KnowledgeBase`] wires the whole stack together — project manager,
//! shared embedding cache, vector adapter, hybrid engine, per-project
//! semantic caches — and exposes the operations the HTTP layer calls.
//! Authentication, instrumentation, graceful degradation, and the semantic
//! cache policy all live here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use asupersync::Cx;
use serde::{Deserialize, Serialize};

use knowledgebeast_core::{
    ApiKeyRecord, ApiKeyScope, ComponentHealth, Config, HealthReport, HealthStatus, IngestItem,
    IngestResponse, KbError, KbResult, Project, QueryMode, QueryRequest, QueryResponse,
    QueryResultItem, global_metrics,
};
use knowledgebeast_db::{DbPoolConfig, create_pool, queries};
use knowledgebeast_search_core::{
    BreakerConfig, Chunker, ChunkerConfig, CircuitState, Embedder, EmbeddingCache, EngineConfig,
    HashEmbedder, HybridQueryEngine, MemoryVectorBackend, ProjectIndexes, Reranker, RetryPolicy,
    SearchSpec, TokenOverlapReranker, VectorBackend, VectorStoreAdapter,
};

use crate::archive::{self, ProjectArchive};
use crate::ingest::{self, IngestDeps};
use crate::projects::ProjectManager;

/// One event in a `query_stream` response, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEvent {
    /// An early partial: the candidate is in the running but not final.
    Candidate { item: QueryResultItem },
    /// A finalized item at its definitive rank.
    Result { rank: usize, item: QueryResultItem },
    /// Terminal success marker.
    Done {
        count: usize,
        degraded: bool,
        reranked: bool,
    },
    /// Terminal failure marker (already-emitted results remain valid).
    Error {
        error_type: String,
        message: String,
    },
}

impl StreamEvent {
    /// SSE event name.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Candidate { .. } => "candidate",
            Self::Result { .. } => "result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// The assembled knowledge base service.
pub struct KnowledgeBase {
    config: Config,
    manager: ProjectManager,
    engine: HybridQueryEngine,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    embeddings: Arc<EmbeddingCache>,
    vectors: Arc<VectorStoreAdapter>,
}

impl KnowledgeBase {
    /// Assemble the service against an explicit vector backend.
    ///
    /// # Errors
    /// Configuration errors (bad database URL, zero cache sizes).
    pub fn new(config: Config, backend: Arc<dyn VectorBackend>) -> KbResult<Self> {
        let pool = create_pool(&DbPoolConfig::for_url(config.database_url.clone()))?;

        let embedder: Arc<dyn Embedder> =
            Arc::new(HashEmbedder::with_model_id(config.embedding_model_id.clone()));
        let embeddings = Arc::new(EmbeddingCache::new(config.cache_size_embedding)?);

        let vectors = Arc::new(VectorStoreAdapter::new(
            backend,
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                window: Duration::from_secs(config.breaker_window_seconds),
                cooldown: Duration::from_secs(config.breaker_cooldown_seconds),
                half_open_probes: config.breaker_half_open_probes,
            },
            RetryPolicy {
                max_attempts: config.retry_max_attempts,
                initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
                multiplier: config.retry_multiplier,
                max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
                jitter: config.retry_jitter,
            },
        ));

        let reranker: Option<Arc<dyn Reranker>> = config
            .rerank_model_id
            .as_ref()
            .map(|_| Arc::new(TokenOverlapReranker::new()) as Arc<dyn Reranker>);

        #[allow(clippy::cast_possible_truncation)]
        let engine = HybridQueryEngine::new(
            Arc::clone(&embedder),
            Arc::clone(&embeddings),
            Arc::clone(&vectors),
            reranker,
            EngineConfig {
                alpha: config.hybrid_alpha as f32,
                ..EngineConfig::default()
            },
        );

        let chunker = Chunker::new(
            ChunkerConfig {
                chunk_size_tokens: config.chunk_size_tokens,
                overlap_tokens: config.chunk_overlap_tokens,
                ..ChunkerConfig::default()
            },
            Arc::clone(&embedder),
            Arc::clone(&embeddings),
        )?;

        let manager = ProjectManager::new(config.clone(), pool, Arc::clone(&vectors));

        Ok(Self {
            config,
            manager,
            engine,
            chunker,
            embedder,
            embeddings,
            vectors,
        })
    }

    /// Assemble with the in-process vector backend.
    ///
    /// A configured `VECTOR_BACKEND_URL` is noted but this build links no
    /// remote driver; the in-process backend serves in its place.
    ///
    /// # Errors
    /// See [`KnowledgeBase::new`].
    pub fn with_default_backend(config: Config) -> KbResult<Self> {
        if let Some(url) = &config.vector_backend_url {
            tracing::warn!(%url, "no remote vector driver linked; using in-process backend");
        }
        Self::new(config, Arc::new(MemoryVectorBackend::new()))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &ProjectManager {
        &self.manager
    }

    /// The adapter, exposed for health tooling and tests.
    #[must_use]
    pub fn vectors(&self) -> &Arc<VectorStoreAdapter> {
        &self.vectors
    }

    // ── Auth ───────────────────────────────────────────────────────────

    /// Validate a project-scoped API key.
    pub async fn authenticate(
        &self,
        cx: &Cx,
        presented: &str,
        project_id: &str,
        required: ApiKeyScope,
    ) -> KbResult<ApiKeyRecord> {
        self.manager
            .authenticate(cx, presented, project_id, required)
            .await
    }

    /// Whether `token` matches the configured admin token. With no token
    /// configured, admin routes are open (dev mode only).
    #[must_use]
    pub fn is_admin_token(&self, token: Option<&str>) -> bool {
        match &self.config.admin_token {
            None => true,
            Some(expected) => token == Some(expected.as_str()),
        }
    }

    // ── Project lifecycle ──────────────────────────────────────────────

    pub async fn create_project(
        &self,
        cx: &Cx,
        name: &str,
        description: &str,
        metadata: HashMap<String, serde_json::Value>,
        embedding_model_id: Option<&str>,
    ) -> KbResult<Project> {
        self.manager
            .create_project(cx, name, description, metadata, embedding_model_id)
            .await
    }

    pub async fn get_project(&self, cx: &Cx, project_id: &str) -> KbResult<Project> {
        self.manager.get_project(cx, project_id).await
    }

    pub async fn list_projects(&self, cx: &Cx) -> KbResult<Vec<Project>> {
        self.manager.list_projects(cx).await
    }

    pub async fn update_project(
        &self,
        cx: &Cx,
        project_id: &str,
        description: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> KbResult<Project> {
        self.manager
            .update_project(cx, project_id, description, metadata)
            .await
    }

    pub async fn delete_project(&self, cx: &Cx, project_id: &str) -> KbResult<()> {
        self.manager.delete_project(cx, project_id).await
    }

    pub async fn create_api_key(
        &self,
        cx: &Cx,
        project_id: &str,
        scopes: &[ApiKeyScope],
        expires_at: Option<i64>,
    ) -> KbResult<(ApiKeyRecord, String)> {
        self.manager
            .create_api_key(cx, project_id, scopes, expires_at)
            .await
    }

    pub async fn list_api_keys(&self, cx: &Cx, project_id: &str) -> KbResult<Vec<ApiKeyRecord>> {
        self.manager.list_api_keys(cx, project_id).await
    }

    pub async fn revoke_api_key(&self, cx: &Cx, project_id: &str, key_id: &str) -> KbResult<()> {
        self.manager.revoke_api_key(cx, project_id, key_id).await
    }

    // ── Ingest ─────────────────────────────────────────────────────────

    /// Ingest a batch into a project. Per-document failures are reported in
    /// the response, never as an operation error.
    pub async fn ingest(
        &self,
        cx: &Cx,
        project_id: &str,
        items: Vec<IngestItem>,
    ) -> KbResult<IngestResponse> {
        if items.is_empty() {
            return Err(KbError::InvalidArgument("ingest batch is empty".into()));
        }
        let (_, handle) = self.manager.resolve_active(cx, project_id).await?;
        let _permit = handle.inflight.acquire()?;

        let started = Instant::now();
        let deps = IngestDeps {
            chunker: &self.chunker,
            embedder: self.embedder.as_ref(),
            embeddings: &self.embeddings,
            vectors: &self.vectors,
            limits: self.manager.quota_limits(),
            data_dir: &self.config.data_dir,
            workers: self.config.effective_ingest_workers(),
        };
        let response = ingest::ingest_batch(&handle, &deps, items);

        global_metrics()
            .ingest
            .latency_us
            .record(elapsed_us(started));
        tracing::info!(
            project_id,
            accepted = response.accepted,
            failed = response.failed,
            "ingest batch finished"
        );
        Ok(response)
    }

    /// Remove a document and all its chunks.
    pub async fn delete_document(&self, cx: &Cx, project_id: &str, doc_id: &str) -> KbResult<()> {
        let (_, handle) = self.manager.resolve_active(cx, project_id).await?;
        ingest::delete_document(&handle, &self.vectors, doc_id)
    }

    // ── Query ──────────────────────────────────────────────────────────

    /// Execute a query with the full cache + degradation policy.
    pub async fn query(
        &self,
        cx: &Cx,
        project_id: &str,
        request: &QueryRequest,
    ) -> KbResult<QueryResponse> {
        let (_, handle) = self.manager.resolve_active(cx, project_id).await?;
        let _permit = handle.inflight.acquire()?;
        let started = Instant::now();
        let metrics = global_metrics();
        metrics.query.queries_total.inc();

        let span = tracing::info_span!("query", project_id, mode = %request.mode);
        let _enter = span.enter();

        // Empty queries are a successful empty result in every mode.
        if request.query.trim().is_empty() || request.top_k == 0 {
            return Ok(QueryResponse {
                results: Vec::new(),
                mode: request.mode,
                degraded: false,
                reranked: false,
                cache_hit: false,
                took_ms: elapsed_ms(started),
            });
        }

        // The semantic cache needs the query embedding; when the embedder
        // cannot produce one (or the mode is keyword-only) it is bypassed.
        let query_embedding = if request.mode == QueryMode::Keyword {
            None
        } else {
            self.engine.embed_query(&request.query).ok()
        };

        if let Some(embedding) = &query_embedding
            && let Some(results) = handle.semantic.lookup(embedding, request.mode, request.top_k)
        {
            return Ok(QueryResponse {
                results,
                mode: request.mode,
                degraded: false,
                reranked: false,
                cache_hit: true,
                took_ms: elapsed_ms(started),
            });
        }

        let spec = SearchSpec {
            query: &request.query,
            top_k: request.top_k,
            mode: request.mode,
            rerank: request.rerank,
            mmr_lambda: request.mmr_lambda,
            filter: request.filter.as_ref(),
        };
        let indexes = ProjectIndexes {
            project_id: &handle.project_id,
            keyword: &handle.keyword,
            chunks: &handle.chunks,
        };
        let outcome = self.engine.search(indexes, &spec).map_err(|e| {
            metrics.query.query_errors_total.inc();
            KbError::from(e)
        })?;

        if outcome.degraded {
            metrics.query.degraded_total.inc();
        }

        // Cache only clean results: degraded answers would outlive the
        // outage and keep serving the reduced set after recovery.
        if !outcome.degraded
            && let Some(embedding) = query_embedding
        {
            handle.semantic.insert(
                embedding,
                request.mode,
                request.top_k,
                outcome.results.clone(),
            );
        }

        metrics.query.latency_us.record(elapsed_us(started));
        Ok(QueryResponse {
            results: outcome.results,
            mode: request.mode,
            degraded: outcome.degraded,
            reranked: outcome.reranked,
            cache_hit: false,
            took_ms: elapsed_ms(started),
        })
    }

    /// Progressive variant of [`Self::query`]: the same pipeline, delivered
    /// as an ordered event sequence for SSE framing.
    pub async fn query_stream(
        &self,
        cx: &Cx,
        project_id: &str,
        request: &QueryRequest,
    ) -> KbResult<Vec<StreamEvent>> {
        let response = self.query(cx, project_id, request).await?;
        let mut events = Vec::with_capacity(response.results.len() * 2 + 1);
        for item in &response.results {
            events.push(StreamEvent::Candidate { item: item.clone() });
        }
        for (rank, item) in response.results.iter().enumerate() {
            events.push(StreamEvent::Result {
                rank,
                item: item.clone(),
            });
        }
        events.push(StreamEvent::Done {
            count: response.results.len(),
            degraded: response.degraded,
            reranked: response.reranked,
        });
        Ok(events)
    }

    // ── Archive ────────────────────────────────────────────────────────

    pub async fn export_project(&self, cx: &Cx, project_id: &str) -> KbResult<ProjectArchive> {
        archive::export_project(cx, &self.manager, project_id).await
    }

    pub async fn import_project(&self, cx: &Cx, archive_doc: ProjectArchive) -> KbResult<Project> {
        archive::import_project(cx, &self.manager, &self.vectors, archive_doc).await
    }

    // ── Health & metrics ───────────────────────────────────────────────

    /// Probe every dependency and aggregate by worst component. A vector
    /// backend outage alone is `degraded` — keyword-only fallback still
    /// serves queries.
    pub async fn health(&self, cx: &Cx) -> HealthReport {
        let vector = match self.vectors.ping() {
            Ok(()) => ComponentHealth {
                name: "vector_backend".into(),
                status: HealthStatus::Healthy,
                detail: None,
            },
            Err(e) => ComponentHealth {
                name: "vector_backend".into(),
                status: HealthStatus::Degraded,
                detail: Some(format!(
                    "{e} (breaker {})",
                    breaker_label(self.vectors.breaker_state())
                )),
            },
        };

        let embedder = if self.embedder.is_ready() {
            ComponentHealth {
                name: "embedding_model".into(),
                status: HealthStatus::Healthy,
                detail: None,
            }
        } else {
            ComponentHealth {
                name: "embedding_model".into(),
                status: HealthStatus::Unhealthy,
                detail: Some("model not loaded".into()),
            }
        };

        let store = match queries::ping(cx, self.manager.pool()).await.into_result() {
            Ok(()) => ComponentHealth {
                name: "persistent_store".into(),
                status: HealthStatus::Healthy,
                detail: None,
            },
            Err(e) => ComponentHealth {
                name: "persistent_store".into(),
                status: HealthStatus::Unhealthy,
                detail: Some(e.to_string()),
            },
        };

        let disk = self.disk_health();

        HealthReport::aggregate(vec![vector, embedder, store, disk])
    }

    fn disk_health(&self) -> ComponentHealth {
        let min_free = self.config.disk_min_free_mb.saturating_mul(1024 * 1024);
        match fs2::available_space(&self.config.data_dir) {
            Ok(free) if free >= min_free => ComponentHealth {
                name: "disk".into(),
                status: HealthStatus::Healthy,
                detail: None,
            },
            Ok(free) => ComponentHealth {
                name: "disk".into(),
                status: HealthStatus::Unhealthy,
                detail: Some(format!(
                    "only {} MiB free, {} MiB required",
                    free / (1024 * 1024),
                    self.config.disk_min_free_mb
                )),
            },
            // A missing data dir is a config problem, not a full disk.
            Err(e) => ComponentHealth {
                name: "disk".into(),
                status: HealthStatus::Unhealthy,
                detail: Some(format!("probe failed: {e}")),
            },
        }
    }

    /// Prometheus exposition for `/metrics`.
    #[must_use]
    pub fn metrics_text(&self) -> String {
        global_metrics().render_prometheus()
    }

    /// Sweep expired semantic-cache entries across all live projects.
    /// Called by the background sweeper.
    pub fn sweep_semantic_caches(&self) {
        for handle in self.live_handles() {
            handle.semantic.sweep_expired();
        }
    }

    fn live_handles(&self) -> Vec<Arc<crate::projects::ProjectHandle>> {
        // Walk the manager's handle map without holding its lock during the
        // sweep itself (cache locks are leaf locks).
        self.manager.handles_snapshot()
    }
}

const fn breaker_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half-open",
    }
}

fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros().min(u128::from(u64::MAX))).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis().min(u128::from(u64::MAX))).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_names_match_the_sse_contract() {
        let item = QueryResultItem {
            chunk_id: "c".into(),
            doc_id: "d".into(),
            text: "t".into(),
            score: 1.0,
            vector_score: None,
            keyword_score: None,
            metadata: HashMap::new(),
        };
        assert_eq!(
            StreamEvent::Candidate { item: item.clone() }.event_name(),
            "candidate"
        );
        assert_eq!(StreamEvent::Result { rank: 0, item }.event_name(), "result");
        assert_eq!(
            StreamEvent::Done {
                count: 0,
                degraded: false,
                reranked: false
            }
            .event_name(),
            "done"
        );
        assert_eq!(
            StreamEvent::Error {
                error_type: "TIMEOUT".into(),
                message: "m".into()
            }
            .event_name(),
            "error"
        );
    }

    #[test]
    fn admin_token_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.database_url = format!("sqlite:///{}", dir.path().join("kb.sqlite3").display());
        config.admin_token = Some("sekrit".into());
        let kb = KnowledgeBase::with_default_backend(config).unwrap();
        assert!(kb.is_admin_token(Some("sekrit")));
        assert!(!kb.is_admin_token(Some("wrong")));
        assert!(!kb.is_admin_token(None));
    }
}
