//! Error types for the retrieval subsystem.

use thiserror::Error;

/// Result type alias for retrieval operations.
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Errors produced by the caches, reliability wrappers, indexes, and the
/// hybrid engine.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A component was constructed with invalid parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed query input.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The embedding provider failed or is unavailable.
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    /// The vector backend is unreachable or returned a transport error.
    #[error("Vector backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The circuit breaker refused the call without contacting the backend.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// The referenced collection does not exist.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// The cross-encoder re-ranker failed. Non-fatal on the query path.
    #[error("Rerank failed: {0}")]
    RerankFailed(String),

    /// Deadline expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O error during index operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal/unexpected error.
    #[error("Internal search error: {0}")]
    Internal(String),
}

impl SearchError {
    /// Stable machine-readable kind string.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::EmbeddingFailed(_) => "EMBEDDING_FAILED",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::CollectionNotFound(_) => "COLLECTION_NOT_FOUND",
            Self::RerankFailed(_) => "RERANK_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a retry of the same call may succeed.
    ///
    /// `CircuitOpen` is deliberately non-retryable: retrying while the
    /// breaker is open just burns attempts without backend contact.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

impl From<SearchError> for knowledgebeast_core::KbError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::InvalidConfig(m) | SearchError::Internal(m) => Self::Internal(m),
            SearchError::InvalidQuery(m) => Self::InvalidArgument(m),
            SearchError::EmbeddingFailed(m) => Self::BackendUnavailable(format!("embedder: {m}")),
            SearchError::BackendUnavailable(m) => Self::BackendUnavailable(m),
            SearchError::CircuitOpen(m) => Self::CircuitOpen(m),
            SearchError::CollectionNotFound(m) => Self::not_found("collection", m),
            SearchError::RerankFailed(m) => Self::Internal(format!("rerank: {m}")),
            SearchError::Timeout(m) => Self::Timeout(m),
            SearchError::Io(e) => Self::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_is_not_retryable() {
        assert!(!SearchError::CircuitOpen("x".into()).is_retryable());
        assert!(SearchError::BackendUnavailable("x".into()).is_retryable());
        assert!(SearchError::Timeout("x".into()).is_retryable());
        assert!(!SearchError::InvalidQuery("x".into()).is_retryable());
    }

    #[test]
    fn conversion_preserves_backend_kinds() {
        use knowledgebeast_core::KbError;
        let kb: KbError = SearchError::CircuitOpen("breaker".into()).into();
        assert!(matches!(kb, KbError::CircuitOpen(_)));
        let kb: KbError = SearchError::BackendUnavailable("down".into()).into();
        assert!(matches!(kb, KbError::BackendUnavailable(_)));
    }
}
