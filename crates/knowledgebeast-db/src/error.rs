//! Error types for the persistence layer.

use thiserror::Error;

/// Result alias for database operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Database error kinds.
#[derive(Error, Debug)]
pub enum DbError {
    /// `SQLite` error from the underlying driver.
    #[error("SQLite error: {0}")]
    Sqlite(String),

    /// Connection pool error (exhausted, closed, timed out).
    #[error("Pool error: {0}")]
    Pool(String),

    /// Record not found.
    #[error("{entity} not found: {identifier}")]
    NotFound {
        entity: &'static str,
        identifier: String,
    },

    /// Unique-constraint style duplicate.
    #[error("{entity} already exists: {identifier}")]
    Duplicate {
        entity: &'static str,
        identifier: String,
    },

    /// Invalid argument.
    #[error("Invalid {field}: {message}")]
    InvalidArgument {
        field: &'static str,
        message: String,
    },

    /// Stored data failed to decode into the expected shape.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Unexpected internal error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    #[must_use]
    pub fn not_found(entity: &'static str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn duplicate(entity: &'static str, identifier: impl Into<String>) -> Self {
        Self::Duplicate {
            entity,
            identifier: identifier.into(),
        }
    }
}

impl From<DbError> for knowledgebeast_core::KbError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound { entity, identifier } => Self::NotFound { entity, identifier },
            DbError::Duplicate { entity, identifier } => {
                Self::Conflict(format!("{entity} already exists: {identifier}"))
            }
            DbError::InvalidArgument { field, message } => {
                Self::InvalidArgument(format!("{field}: {message}"))
            }
            DbError::Sqlite(m) | DbError::Pool(m) | DbError::CorruptRow(m) | DbError::Internal(m) => {
                Self::Internal(m)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledgebeast_core::KbError;

    #[test]
    fn not_found_maps_to_kb_not_found() {
        let kb: KbError = DbError::not_found("project", "p1").into();
        assert_eq!(kb.status_code(), 404);
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let kb: KbError = DbError::duplicate("project", "docs").into();
        assert_eq!(kb.status_code(), 409);
    }
}
