//! HTTP surface for KnowledgeBeast.
//!
//! JSON over HTTP/1.1 on the `asupersync` h1 listener. Routes live under
//! `/api/v2`; `/health` and `/metrics` sit at the root and bypass
//! authentication. Admin routes (project and key lifecycle) require the
//! configured admin token; project-scoped routes require an `X-API-Key`
//! bound to the project with sufficient scope.
//!
//! `query/stream` renders Server-Sent Events with `candidate`, `result`,
//! `done`, and `error` event types.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use asupersync::http::h1::listener::Http1Listener;
use asupersync::http::h1::types::{
    Method as Http1Method, Request as Http1Request, Response as Http1Response, default_reason,
};
use asupersync::runtime::RuntimeBuilder;
use asupersync::time::{timeout, wall_now};
use asupersync::{Budget, Cx};
use serde::Deserialize;

use knowledgebeast_core::{
    ApiKeyScope, Config, HealthStatus, IngestItem, KbError, KbResult, QueryRequest, global_metrics,
};
use knowledgebeast_service::{KnowledgeBase, ProjectArchive, StreamEvent, sweeper};

/// Header carrying the project API key (or the admin token).
const API_KEY_HEADER: &str = "x-api-key";

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Run the HTTP server until the listener exits.
///
/// # Errors
/// I/O errors from binding or serving, and startup failures (data dir not
/// writable, bad configuration).
pub fn run_http(config: &Config) -> std::io::Result<()> {
    run_startup_probes(config)?;

    let kb = Arc::new(
        KnowledgeBase::with_default_backend(config.clone())
            .map_err(|e| std::io::Error::other(e.to_string()))?,
    );
    sweeper::start(&kb);

    let addr = format!("{}:{}", config.http_host, config.http_port);
    let state = Arc::new(HttpState::new(kb, config.clone()));

    let runtime = RuntimeBuilder::new()
        .build()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let handle = runtime.handle();

    tracing::info!(%addr, "knowledgebeast server starting");
    let result = runtime.block_on(async move {
        let handler_state = Arc::clone(&state);
        let listener = Http1Listener::bind(addr, move |req| {
            let inner = Arc::clone(&handler_state);
            async move { inner.handle(req).await }
        })
        .await?;

        let _stats = listener.run(&handle).await?;
        Ok::<(), std::io::Error>(())
    });

    sweeper::shutdown();
    result
}

/// Pre-flight checks that must pass before the listener binds.
fn run_startup_probes(config: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let probe = config.data_dir.join(".kb-write-probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// State and dispatch
// ---------------------------------------------------------------------------

/// Shared per-process HTTP state.
pub struct HttpState {
    kb: Arc<KnowledgeBase>,
    request_timeout: Duration,
}

impl HttpState {
    #[must_use]
    pub fn new(kb: Arc<KnowledgeBase>, config: Config) -> Self {
        Self {
            kb,
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
        }
    }

    /// Top-level request handler: dispatch, then record metrics and the
    /// request log line.
    pub async fn handle(&self, req: Http1Request) -> Http1Response {
        let started = Instant::now();
        let method = method_label(&req.method);
        let (path, _query) = split_path_query(&req.uri);

        let resp = self.handle_inner(&req, &path).await;

        let metrics = global_metrics();
        metrics.http.requests_total.inc();
        if resp.status >= 500 {
            metrics.http.errors_total.inc();
        }
        let elapsed_us =
            u64::try_from(started.elapsed().as_micros().min(u128::from(u64::MAX))).unwrap_or(u64::MAX);
        metrics.http.latency_us.record(elapsed_us);
        tracing::info!(
            method,
            path,
            status = resp.status,
            duration_ms = elapsed_us / 1_000,
            "http request"
        );
        resp
    }

    async fn handle_inner(&self, req: &Http1Request, path: &str) -> Http1Response {
        // Health and metrics bypass auth.
        if path == "/health" || path == "/healthz" {
            if !matches!(req.method, Http1Method::Get) {
                return error_response(405, "Method Not Allowed");
            }
            return self.handle_health().await;
        }
        if path == "/metrics" {
            if !matches!(req.method, Http1Method::Get) {
                return error_response(405, "Method Not Allowed");
            }
            return raw_response(200, "text/plain; version=0.0.4", self.kb.metrics_text().into_bytes());
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["api", "v2", "projects"] => match req.method {
                Http1Method::Post => self.create_project(req).await,
                Http1Method::Get => self.list_projects(req).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", "import"] => match req.method {
                Http1Method::Post => self.import_project(req).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id] => match req.method {
                Http1Method::Get => self.get_project(req, project_id).await,
                Http1Method::Put => self.update_project(req, project_id).await,
                Http1Method::Delete => self.delete_project(req, project_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "ingest"] => match req.method {
                Http1Method::Post => self.ingest(req, project_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "query"] => match req.method {
                Http1Method::Post => self.query(req, project_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "query", "stream"] => match req.method {
                Http1Method::Post => self.query_stream(req, project_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "export"] => match req.method {
                Http1Method::Post => self.export_project(req, project_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "documents", doc_id] => match req.method {
                Http1Method::Delete => self.delete_document(req, project_id, doc_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "api-keys"] => match req.method {
                Http1Method::Post => self.create_api_key(req, project_id).await,
                Http1Method::Get => self.list_api_keys(req, project_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            ["api", "v2", "projects", project_id, "api-keys", key_id] => match req.method {
                Http1Method::Delete => self.revoke_api_key(req, project_id, key_id).await,
                _ => error_response(405, "Method Not Allowed"),
            },
            _ => error_response(404, "Not Found"),
        }
    }

    // ── Auth helpers ───────────────────────────────────────────────────

    fn request_cx(&self) -> Cx {
        let budget = if self.request_timeout.is_zero() {
            Budget::INFINITE
        } else {
            // Relative deadline anchored at wall_now(), not an absolute epoch.
            Budget::new().with_deadline(wall_now() + self.request_timeout)
        };
        Cx::for_request_with_budget(budget)
    }

    /// Admin gate: the configured admin token must be presented.
    fn require_admin(&self, req: &Http1Request) -> KbResult<()> {
        if self.kb.is_admin_token(header_value(req, API_KEY_HEADER)) {
            Ok(())
        } else {
            global_metrics().http.unauthorized_total.inc();
            Err(KbError::Unauthenticated("admin token required".into()))
        }
    }

    /// Project gate: admin token passes everything; otherwise the presented
    /// key must authorize `required` on `project_id`.
    async fn require_project_access(
        &self,
        cx: &Cx,
        req: &Http1Request,
        project_id: &str,
        required: ApiKeyScope,
    ) -> KbResult<()> {
        let presented = header_value(req, API_KEY_HEADER);
        if self.kb.config().admin_token.is_some() && self.kb.is_admin_token(presented) {
            return Ok(());
        }
        let Some(presented) = presented else {
            global_metrics().http.unauthorized_total.inc();
            return Err(KbError::Unauthenticated("missing X-API-Key header".into()));
        };
        match self.kb.authenticate(cx, presented, project_id, required).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.status_code() == 401 {
                    global_metrics().http.unauthorized_total.inc();
                }
                Err(e)
            }
        }
    }

    /// Run an operation future under the request deadline.
    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = KbResult<T>>,
    ) -> KbResult<T> {
        if self.request_timeout.is_zero() {
            return fut.await;
        }
        match timeout(wall_now(), self.request_timeout, fut).await {
            Ok(out) => out,
            Err(_) => Err(KbError::Timeout(format!(
                "request exceeded {}s deadline",
                self.request_timeout.as_secs()
            ))),
        }
    }

    // ── Route handlers ─────────────────────────────────────────────────

    async fn handle_health(&self) -> Http1Response {
        let cx = self.request_cx();
        let report = self.kb.health(&cx).await;
        let status = if report.status == HealthStatus::Unhealthy {
            503
        } else {
            200
        };
        match serde_json::to_value(&report) {
            Ok(body) => json_response(status, &body),
            Err(e) => error_response(500, &format!("health serialization failed: {e}")),
        }
    }

    async fn create_project(&self, req: &Http1Request) -> Http1Response {
        #[derive(Deserialize)]
        struct Body {
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            metadata: HashMap<String, serde_json::Value>,
            #[serde(default)]
            embedding_model_id: Option<String>,
        }

        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let body: Body = match parse_body(req) {
            Ok(b) => b,
            Err(resp) => return *resp,
        };
        let cx = self.request_cx();
        let out = self
            .with_deadline(self.kb.create_project(
                &cx,
                &body.name,
                &body.description,
                body.metadata,
                body.embedding_model_id.as_deref(),
            ))
            .await;
        match out {
            Ok(project) => json_value_response(201, &project),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn list_projects(&self, req: &Http1Request) -> Http1Response {
        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let cx = self.request_cx();
        match self.with_deadline(self.kb.list_projects(&cx)).await {
            Ok(projects) => json_value_response(200, &serde_json::json!({ "projects": projects })),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn get_project(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Read)
            .await
        {
            return kb_error_response(&e);
        }
        match self.with_deadline(self.kb.get_project(&cx, project_id)).await {
            Ok(project) => json_value_response(200, &project),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn update_project(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            description: Option<String>,
            #[serde(default)]
            metadata: Option<HashMap<String, serde_json::Value>>,
        }

        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Write)
            .await
        {
            return kb_error_response(&e);
        }
        let body: Body = match parse_body(req) {
            Ok(b) => b,
            Err(resp) => return *resp,
        };
        let out = self
            .with_deadline(self.kb.update_project(
                &cx,
                project_id,
                body.description.as_deref(),
                body.metadata,
            ))
            .await;
        match out {
            Ok(project) => json_value_response(200, &project),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn delete_project(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let cx = self.request_cx();
        match self.with_deadline(self.kb.delete_project(&cx, project_id)).await {
            Ok(()) => Http1Response::new(204, default_reason(204), Vec::new()),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn ingest(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        #[derive(Deserialize)]
        struct Body {
            documents: Vec<IngestItem>,
        }

        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Write)
            .await
        {
            return kb_error_response(&e);
        }

        // Accept either a batch ({"documents": [...]}) or a single item.
        let items: Vec<IngestItem> = match parse_body::<Body>(req) {
            Ok(batch) => batch.documents,
            Err(_) => match parse_body::<IngestItem>(req) {
                Ok(single) => vec![single],
                Err(resp) => return *resp,
            },
        };

        match self
            .with_deadline(self.kb.ingest(&cx, project_id, items))
            .await
        {
            Ok(response) => json_value_response(200, &response),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn query(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Read)
            .await
        {
            return kb_error_response(&e);
        }
        let request: QueryRequest = match parse_body(req) {
            Ok(b) => b,
            Err(resp) => return *resp,
        };
        match self
            .with_deadline(self.kb.query(&cx, project_id, &request))
            .await
        {
            Ok(response) => json_value_response(200, &response),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn query_stream(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Read)
            .await
        {
            return kb_error_response(&e);
        }
        let request: QueryRequest = match parse_body(req) {
            Ok(b) => b,
            Err(resp) => return *resp,
        };
        let events = match self
            .with_deadline(self.kb.query_stream(&cx, project_id, &request))
            .await
        {
            Ok(events) => events,
            // Execution failures terminate the stream with an error event;
            // results already framed above it remain valid.
            Err(e) => vec![StreamEvent::Error {
                error_type: e.error_type().to_string(),
                message: e.to_string(),
            }],
        };
        raw_response(200, "text/event-stream", render_sse(&events).into_bytes())
    }

    async fn export_project(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Read)
            .await
        {
            return kb_error_response(&e);
        }
        match self
            .with_deadline(self.kb.export_project(&cx, project_id))
            .await
        {
            Ok(archive) => json_value_response(200, &archive),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn import_project(&self, req: &Http1Request) -> Http1Response {
        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let archive: ProjectArchive = match parse_body(req) {
            Ok(b) => b,
            Err(resp) => return *resp,
        };
        let cx = self.request_cx();
        match self.with_deadline(self.kb.import_project(&cx, archive)).await {
            Ok(project) => json_value_response(201, &project),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn delete_document(
        &self,
        req: &Http1Request,
        project_id: &str,
        doc_id: &str,
    ) -> Http1Response {
        let cx = self.request_cx();
        if let Err(e) = self
            .require_project_access(&cx, req, project_id, ApiKeyScope::Write)
            .await
        {
            return kb_error_response(&e);
        }
        match self
            .with_deadline(self.kb.delete_document(&cx, project_id, doc_id))
            .await
        {
            Ok(()) => Http1Response::new(204, default_reason(204), Vec::new()),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn create_api_key(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        #[derive(Deserialize)]
        struct Body {
            scopes: Vec<String>,
            #[serde(default)]
            expires_at: Option<i64>,
        }

        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let body: Body = match parse_body(req) {
            Ok(b) => b,
            Err(resp) => return *resp,
        };
        let scopes: Vec<ApiKeyScope> = match body
            .scopes
            .iter()
            .map(|s| s.parse::<ApiKeyScope>())
            .collect::<Result<_, _>>()
        {
            Ok(s) => s,
            Err(e) => return kb_error_response(&e),
        };
        let cx = self.request_cx();
        match self
            .with_deadline(self.kb.create_api_key(&cx, project_id, &scopes, body.expires_at))
            .await
        {
            Ok((record, plaintext)) => json_value_response(
                201,
                &serde_json::json!({ "key": record, "api_key": plaintext }),
            ),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn list_api_keys(&self, req: &Http1Request, project_id: &str) -> Http1Response {
        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let cx = self.request_cx();
        match self.with_deadline(self.kb.list_api_keys(&cx, project_id)).await {
            Ok(keys) => json_value_response(200, &serde_json::json!({ "keys": keys })),
            Err(e) => kb_error_response(&e),
        }
    }

    async fn revoke_api_key(
        &self,
        req: &Http1Request,
        project_id: &str,
        key_id: &str,
    ) -> Http1Response {
        if let Err(e) = self.require_admin(req) {
            return kb_error_response(&e);
        }
        let cx = self.request_cx();
        match self
            .with_deadline(self.kb.revoke_api_key(&cx, project_id, key_id))
            .await
        {
            Ok(()) => Http1Response::new(204, default_reason(204), Vec::new()),
            Err(e) => kb_error_response(&e),
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response helpers
// ---------------------------------------------------------------------------

fn split_path_query(uri: &str) -> (String, Option<String>) {
    let mut parts = uri.splitn(2, '?');
    let path = parts.next().unwrap_or("/").to_string();
    let query = parts.next().map(std::string::ToString::to_string);
    (path, query)
}

fn header_value<'a>(req: &'a Http1Request, name: &str) -> Option<&'a str> {
    req.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn method_label(method: &Http1Method) -> &'static str {
    match method {
        Http1Method::Get => "GET",
        Http1Method::Post => "POST",
        Http1Method::Put => "PUT",
        Http1Method::Delete => "DELETE",
        Http1Method::Options => "OPTIONS",
        Http1Method::Head => "HEAD",
        Http1Method::Patch => "PATCH",
        _ => "OTHER",
    }
}

/// Parse a JSON body; malformed input is the caller's *InvalidArgument*.
fn parse_body<T: serde::de::DeserializeOwned>(req: &Http1Request) -> Result<T, Box<Http1Response>> {
    serde_json::from_slice(&req.body).map_err(|e| {
        Box::new(kb_error_response(&KbError::InvalidArgument(format!(
            "malformed request body: {e}"
        ))))
    })
}

fn json_response(status: u16, value: &serde_json::Value) -> Http1Response {
    let mut resp = Http1Response::new(
        status,
        default_reason(status),
        serde_json::to_vec(value).unwrap_or_default(),
    );
    resp.headers
        .push(("content-type".to_string(), "application/json".to_string()));
    resp
}

fn json_value_response<T: serde::Serialize>(status: u16, value: &T) -> Http1Response {
    match serde_json::to_value(value) {
        Ok(v) => json_response(status, &v),
        Err(e) => error_response(500, &format!("response serialization failed: {e}")),
    }
}

fn raw_response(status: u16, content_type: &str, body: Vec<u8>) -> Http1Response {
    let mut resp = Http1Response::new(status, default_reason(status), body);
    resp.headers
        .push(("content-type".to_string(), content_type.to_string()));
    resp
}

fn error_response(status: u16, message: &str) -> Http1Response {
    json_response(status, &serde_json::json!({ "detail": message }))
}

/// Translate an internal error into its external status and body.
fn kb_error_response(e: &KbError) -> Http1Response {
    let status = e.status_code();
    if status >= 500 {
        tracing::error!(error = %e, error_type = e.error_type(), "request failed");
    }
    json_response(
        status,
        &serde_json::json!({ "detail": e.to_string(), "error_type": e.error_type() }),
    )
}

/// Frame stream events as Server-Sent Events.
fn render_sse(events: &[StreamEvent]) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str("event: ");
        out.push_str(event.event_name());
        out.push('\n');
        out.push_str("data: ");
        out.push_str(&serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()));
        out.push_str("\n\n");
    }
    out
}
