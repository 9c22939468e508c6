//! Error taxonomy for KnowledgeBeast.
//!
//! Every internal failure is classified into one of the kinds below; the HTTP
//! layer translates kinds to status codes via [`KbError::status_code`].

use thiserror::Error;

/// Result type alias for KnowledgeBeast operations.
pub type KbResult<T> = std::result::Result<T, KbError>;

/// Main error type for KnowledgeBeast.
#[derive(Debug, Error)]
pub enum KbError {
    /// Malformed input: unknown mode, empty required field, bad parameter.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or invalid API key.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Key scope insufficient or key bound to a different project.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown project, document, or API key.
    #[error("{entity} not found: {identifier}")]
    NotFound {
        entity: &'static str,
        identifier: String,
    },

    /// Duplicate project name or concurrent delete in progress.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Per-project quota or rate limit breached.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Operation deadline expired.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The vector backend is unreachable or refusing work.
    #[error("Vector backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The circuit breaker is open; no backend contact was attempted.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Project delete tore down only some child resources; the record stays
    /// in the `deleting` state and the delete may be retried.
    #[error("Partial delete of project {0}; retry to resume")]
    PartialDelete(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal error. Always logged with a trace id before
    /// translation to a response.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KbError {
    /// Convenience constructor for [`KbError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            identifier: identifier.into(),
        }
    }

    /// Stable machine-readable error type string (for JSON responses).
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Timeout(_) => "TIMEOUT",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::PartialDelete(_) => "PARTIAL_DELETE",
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status code for this error kind.
    ///
    /// `CircuitOpen` maps the same as `BackendUnavailable`: the caller cannot
    /// tell (and should not care) whether the breaker or the backend itself
    /// refused the call.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::QuotaExceeded(_) => 429,
            Self::Timeout(_) => 504,
            Self::BackendUnavailable(_) | Self::CircuitOpen(_) => 503,
            Self::PartialDelete(_) => 202,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether a degraded keyword-only fallback is permitted for this error
    /// (hybrid queries only).
    #[must_use]
    pub const fn allows_keyword_fallback(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::CircuitOpen(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(KbError::InvalidArgument("x".into()).status_code(), 400);
        assert_eq!(KbError::Unauthenticated("x".into()).status_code(), 401);
        assert_eq!(KbError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(KbError::not_found("project", "p1").status_code(), 404);
        assert_eq!(KbError::Conflict("x".into()).status_code(), 409);
        assert_eq!(KbError::QuotaExceeded("x".into()).status_code(), 429);
        assert_eq!(KbError::Timeout("x".into()).status_code(), 504);
        assert_eq!(KbError::BackendUnavailable("x".into()).status_code(), 503);
        assert_eq!(KbError::CircuitOpen("x".into()).status_code(), 503);
        assert_eq!(KbError::PartialDelete("p1".into()).status_code(), 202);
        assert_eq!(KbError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn circuit_open_and_backend_unavailable_share_external_mapping() {
        let a = KbError::CircuitOpen("breaker".into());
        let b = KbError::BackendUnavailable("down".into());
        assert_eq!(a.status_code(), b.status_code());
        assert!(a.allows_keyword_fallback());
        assert!(b.allows_keyword_fallback());
    }

    #[test]
    fn not_found_formats_entity_and_identifier() {
        let e = KbError::not_found("document", "doc-42");
        assert_eq!(e.to_string(), "document not found: doc-42");
        assert_eq!(e.error_type(), "NOT_FOUND");
    }
}
