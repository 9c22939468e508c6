//! Environment-driven configuration.
//!
//! One [`Config`] struct feeds the whole service. Every recognized option has
//! a named default; malformed values fall back rather than abort, and
//! out-of-range ratios are clamped into their documented ranges.

use std::env;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_EMBEDDING_MODEL_ID: &str = "kb-hash-64";
pub const DEFAULT_CACHE_SIZE_QUERY: usize = 100;
pub const DEFAULT_CACHE_SIZE_EMBEDDING: usize = 10_000;
pub const DEFAULT_SEMANTIC_CACHE_THRESHOLD: f64 = 0.95;
pub const DEFAULT_SEMANTIC_CACHE_TTL_SECONDS: u64 = 300;
pub const DEFAULT_HYBRID_ALPHA: f64 = 0.7;
pub const DEFAULT_CHUNK_SIZE_TOKENS: usize = 256;
pub const DEFAULT_CHUNK_OVERLAP_TOKENS: usize = 32;
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_BREAKER_COOLDOWN_SECONDS: u64 = 30;
pub const DEFAULT_BREAKER_HALF_OPEN_PROBES: u32 = 2;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 50;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RETRY_JITTER: f64 = 0.25;
pub const DEFAULT_PER_PROJECT_MAX_INFLIGHT: usize = 32;
pub const DEFAULT_PER_PROJECT_RATE_LIMIT: u32 = 600;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8765;
pub const DEFAULT_DISK_MIN_FREE_MB: u64 = 512;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Cap on auto-detected ingest workers; more threads just thrash the
/// embedding cache locks.
pub const INGEST_WORKERS_CAP: usize = 8;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Service configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    // Persistence
    /// Root for SQLite, file-backed ingests, and archive staging.
    pub data_dir: PathBuf,
    /// `sqlite:///...` URL for the project/key store.
    pub database_url: String,

    // Models and backends
    /// Remote vector backend endpoint; `None` selects the in-process backend.
    pub vector_backend_url: Option<String>,
    pub embedding_model_id: String,
    /// Cross-encoder model for re-ranking; `None` disables rerank requests.
    pub rerank_model_id: Option<String>,

    // Caches
    pub cache_size_query: usize,
    pub cache_size_embedding: usize,
    /// Cosine similarity required for a semantic cache hit, in `[0, 1]`.
    pub semantic_cache_threshold: f64,
    pub semantic_cache_ttl_seconds: u64,

    // Ranking
    /// Vector-stream weight in hybrid fusion, in `[0, 1]`.
    pub hybrid_alpha: f64,

    // Chunking
    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,

    // Reliability
    pub breaker_failure_threshold: u32,
    pub breaker_window_seconds: u64,
    pub breaker_cooldown_seconds: u64,
    pub breaker_half_open_probes: u32,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_multiplier: f64,
    pub retry_jitter: f64,

    // Tenancy limits
    pub per_project_max_inflight: usize,
    /// Requests per minute per `(api_key, project)`; 0 disables rate limiting.
    pub per_project_rate_limit: u32,
    /// 0 = unlimited.
    pub quota_max_documents: usize,
    /// 0 = unlimited.
    pub quota_max_bytes: u64,

    // Ingest
    /// 0 = auto (`available_parallelism`, capped).
    pub ingest_workers: usize,

    // Serving
    pub request_timeout_seconds: u64,
    pub http_host: String,
    pub http_port: u16,
    /// Bearer token for admin routes (project/key lifecycle). `None` leaves
    /// admin routes open, which is only sane in tests and local dev.
    pub admin_token: Option<String>,
    pub disk_min_free_mb: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        let database_url = default_database_url(&data_dir);
        Self {
            data_dir,
            database_url,
            vector_backend_url: None,
            embedding_model_id: DEFAULT_EMBEDDING_MODEL_ID.to_string(),
            rerank_model_id: None,
            cache_size_query: DEFAULT_CACHE_SIZE_QUERY,
            cache_size_embedding: DEFAULT_CACHE_SIZE_EMBEDDING,
            semantic_cache_threshold: DEFAULT_SEMANTIC_CACHE_THRESHOLD,
            semantic_cache_ttl_seconds: DEFAULT_SEMANTIC_CACHE_TTL_SECONDS,
            hybrid_alpha: DEFAULT_HYBRID_ALPHA,
            chunk_size_tokens: DEFAULT_CHUNK_SIZE_TOKENS,
            chunk_overlap_tokens: DEFAULT_CHUNK_OVERLAP_TOKENS,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_window_seconds: DEFAULT_BREAKER_WINDOW_SECONDS,
            breaker_cooldown_seconds: DEFAULT_BREAKER_COOLDOWN_SECONDS,
            breaker_half_open_probes: DEFAULT_BREAKER_HALF_OPEN_PROBES,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            retry_max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_jitter: DEFAULT_RETRY_JITTER,
            per_project_max_inflight: DEFAULT_PER_PROJECT_MAX_INFLIGHT,
            per_project_rate_limit: DEFAULT_PER_PROJECT_RATE_LIMIT,
            quota_max_documents: 0,
            quota_max_bytes: 0,
            ingest_workers: 0,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            admin_token: None,
            disk_min_free_mb: DEFAULT_DISK_MIN_FREE_MB,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    ///
    /// Unknown or malformed values fall back to defaults; ratios are clamped
    /// into `[0, 1]`. This never fails: a service that cannot parse an env
    /// var should come up with defaults, not refuse to start.
    #[must_use]
    pub fn from_env() -> Self {
        let data_dir = env_value("DATA_DIR").map_or_else(|| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from);
        let database_url =
            env_value("DATABASE_URL").unwrap_or_else(|| default_database_url(&data_dir));

        Self {
            database_url,
            vector_backend_url: env_value("VECTOR_BACKEND_URL").filter(|s| !s.trim().is_empty()),
            embedding_model_id: env_value("EMBEDDING_MODEL_ID")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL_ID.to_string()),
            rerank_model_id: env_value("RERANK_MODEL_ID").filter(|s| !s.trim().is_empty()),
            cache_size_query: env_usize("CACHE_SIZE_QUERY", DEFAULT_CACHE_SIZE_QUERY).max(1),
            cache_size_embedding: env_usize("CACHE_SIZE_EMBEDDING", DEFAULT_CACHE_SIZE_EMBEDDING)
                .max(1),
            semantic_cache_threshold: env_ratio(
                "SEMANTIC_CACHE_THRESHOLD",
                DEFAULT_SEMANTIC_CACHE_THRESHOLD,
            ),
            semantic_cache_ttl_seconds: env_u64(
                "SEMANTIC_CACHE_TTL_SECONDS",
                DEFAULT_SEMANTIC_CACHE_TTL_SECONDS,
            ),
            hybrid_alpha: env_ratio("HYBRID_ALPHA", DEFAULT_HYBRID_ALPHA),
            chunk_size_tokens: env_usize("CHUNK_SIZE_TOKENS", DEFAULT_CHUNK_SIZE_TOKENS).max(8),
            chunk_overlap_tokens: env_usize("CHUNK_OVERLAP_TOKENS", DEFAULT_CHUNK_OVERLAP_TOKENS),
            breaker_failure_threshold: env_u32(
                "BREAKER_FAILURE_THRESHOLD",
                DEFAULT_BREAKER_FAILURE_THRESHOLD,
            )
            .max(1),
            breaker_window_seconds: env_u64(
                "BREAKER_WINDOW_SECONDS",
                DEFAULT_BREAKER_WINDOW_SECONDS,
            )
            .max(1),
            breaker_cooldown_seconds: env_u64(
                "BREAKER_COOLDOWN_SECONDS",
                DEFAULT_BREAKER_COOLDOWN_SECONDS,
            )
            .max(1),
            breaker_half_open_probes: env_u32(
                "BREAKER_HALF_OPEN_PROBES",
                DEFAULT_BREAKER_HALF_OPEN_PROBES,
            )
            .max(1),
            retry_max_attempts: env_u32("RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS).max(1),
            retry_initial_backoff_ms: env_u64(
                "RETRY_INITIAL_BACKOFF_MS",
                DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            ),
            retry_max_backoff_ms: env_u64("RETRY_MAX_BACKOFF_MS", DEFAULT_RETRY_MAX_BACKOFF_MS),
            retry_multiplier: env_f64("RETRY_MULTIPLIER", DEFAULT_RETRY_MULTIPLIER).max(1.0),
            retry_jitter: env_ratio("RETRY_JITTER", DEFAULT_RETRY_JITTER),
            per_project_max_inflight: env_usize(
                "PER_PROJECT_MAX_INFLIGHT",
                DEFAULT_PER_PROJECT_MAX_INFLIGHT,
            )
            .max(1),
            per_project_rate_limit: env_u32(
                "PER_PROJECT_RATE_LIMIT",
                DEFAULT_PER_PROJECT_RATE_LIMIT,
            ),
            quota_max_documents: env_usize("QUOTA_MAX_DOCUMENTS", 0),
            quota_max_bytes: env_u64("QUOTA_MAX_BYTES", 0),
            ingest_workers: env_usize("INGEST_WORKERS", 0),
            request_timeout_seconds: env_u64(
                "REQUEST_TIMEOUT_SECONDS",
                DEFAULT_REQUEST_TIMEOUT_SECONDS,
            ),
            http_host: env_value("HTTP_HOST").unwrap_or_else(|| DEFAULT_HTTP_HOST.to_string()),
            http_port: env_u16("HTTP_PORT", DEFAULT_HTTP_PORT),
            admin_token: env_value("KB_ADMIN_TOKEN").filter(|s| !s.trim().is_empty()),
            disk_min_free_mb: env_u64("DISK_MIN_FREE_MB", DEFAULT_DISK_MIN_FREE_MB),
            log_level: env_value("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            data_dir,
        }
    }

    /// Effective number of ingest worker threads.
    #[must_use]
    pub fn effective_ingest_workers(&self) -> usize {
        if self.ingest_workers > 0 {
            return self.ingest_workers;
        }
        std::thread::available_parallelism()
            .map_or(2, std::num::NonZero::get)
            .min(INGEST_WORKERS_CAP)
    }
}

fn default_database_url(data_dir: &std::path::Path) -> String {
    format!("sqlite:///{}", data_dir.join("knowledgebeast.sqlite3").display())
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

/// Read a raw environment value. Empty strings are treated as present; use
/// `.filter()` at call sites that want to ignore them.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_value(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_value(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_value(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_value(key)
        .and_then(|s| s.trim().parse().ok())
        .filter(|v: &f64| v.is_finite())
        .unwrap_or(default)
}

/// A float confined to `[0, 1]`; out-of-range values are clamped.
fn env_ratio(key: &str, default: f64) -> f64 {
    env_f64(key, default).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.hybrid_alpha > 0.0 && cfg.hybrid_alpha < 1.0);
        assert!(cfg.semantic_cache_threshold >= 0.9);
        assert!(cfg.chunk_overlap_tokens < cfg.chunk_size_tokens);
        assert!(cfg.breaker_failure_threshold >= 1);
        assert!(cfg.database_url.starts_with("sqlite:///"));
    }

    #[test]
    fn effective_ingest_workers_is_bounded() {
        let mut cfg = Config::default();
        cfg.ingest_workers = 0;
        let auto = cfg.effective_ingest_workers();
        assert!(auto >= 1 && auto <= INGEST_WORKERS_CAP);

        cfg.ingest_workers = 3;
        assert_eq!(cfg.effective_ingest_workers(), 3);
    }
}
