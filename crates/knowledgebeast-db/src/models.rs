//! Persistence rows using sqlmodel derive macros.
//!
//! Rows map directly to `SQLite` tables. Datetime fields are `i64`
//! microseconds since the Unix epoch; JSON blobs are stored as TEXT.

use serde::{Deserialize, Serialize};
use sqlmodel::Model;
use std::collections::HashMap;
use std::str::FromStr;

use knowledgebeast_core::{ApiKeyRecord, ApiKeyScope, Project, ProjectState, now_micros};

use crate::error::DbError;

// =============================================================================
// Project
// =============================================================================

/// A tenant project record.
///
/// # Constraints
/// - `id`: opaque URL-safe string, primary key.
/// - `name`: unique across the table (duplicate names are a *Conflict*).
/// - `state`: `active` or `deleting`.
#[derive(Model, Debug, Clone, Serialize, Deserialize)]
#[sqlmodel(table = "projects")]
pub struct ProjectRow {
    #[sqlmodel(primary_key)]
    pub id: String,

    #[sqlmodel(unique)]
    pub name: String,

    pub description: String,

    pub embedding_model_id: String,

    /// Microseconds since Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,

    /// Free-form client metadata, JSON-encoded.
    pub metadata_json: String,

    /// `active` | `deleting`.
    pub state: String,
}

impl ProjectRow {
    /// Create a fresh active project row.
    #[must_use]
    pub fn new(id: String, name: String, description: String, embedding_model_id: String) -> Self {
        let now = now_micros();
        Self {
            id,
            name,
            description,
            embedding_model_id,
            created_at: now,
            updated_at: now,
            metadata_json: "{}".to_string(),
            state: ProjectState::Active.to_string(),
        }
    }

    /// Decode into the wire-facing model.
    ///
    /// # Errors
    /// `CorruptRow` when the stored metadata or state cannot be decoded.
    pub fn into_project(self) -> Result<Project, DbError> {
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_str(&self.metadata_json)
            .map_err(|e| DbError::CorruptRow(format!("project {} metadata: {e}", self.id)))?;
        let state = ProjectState::from_str(&self.state)
            .map_err(|e| DbError::CorruptRow(format!("project {}: {e}", self.id)))?;
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            embedding_model_id: self.embedding_model_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            state,
            metadata,
        })
    }
}

// =============================================================================
// API key
// =============================================================================

/// A hashed API key record. The plaintext secret exists only in the create
/// response; at rest we keep `sha256(salt || secret)`.
#[derive(Model, Debug, Clone, Serialize, Deserialize)]
#[sqlmodel(table = "api_keys")]
pub struct ApiKeyRow {
    #[sqlmodel(primary_key)]
    pub key_id: String,

    pub project_id: String,

    /// Hex-encoded `sha256(salt || secret)`.
    pub hash: String,

    /// Hex-encoded random salt.
    pub salt: String,

    /// Comma-separated scope list (`read,write`).
    pub scopes: String,

    /// Microseconds since epoch; NULL = never expires.
    pub expires_at: Option<i64>,

    pub last_used_at: Option<i64>,

    /// SQLite bool as 0/1.
    pub revoked: i64,

    pub created_at: i64,
}

impl ApiKeyRow {
    /// Parse the stored scope list.
    ///
    /// # Errors
    /// `CorruptRow` when an unknown scope name is stored.
    pub fn parsed_scopes(&self) -> Result<Vec<ApiKeyScope>, DbError> {
        self.scopes
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                ApiKeyScope::from_str(s)
                    .map_err(|_| DbError::CorruptRow(format!("api key {}: bad scope {s:?}", self.key_id)))
            })
            .collect()
    }

    /// Encode a scope list for storage.
    #[must_use]
    pub fn encode_scopes(scopes: &[ApiKeyScope]) -> String {
        scopes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        self.revoked != 0
    }

    /// Decode into the wire-facing record (no hash material).
    ///
    /// # Errors
    /// `CorruptRow` on undecodable scopes.
    pub fn into_record(self) -> Result<ApiKeyRecord, DbError> {
        let scopes = self.parsed_scopes()?;
        Ok(ApiKeyRecord {
            key_id: self.key_id,
            project_id: self.project_id,
            scopes,
            expires_at: self.expires_at,
            last_used_at: self.last_used_at,
            revoked: self.revoked != 0,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_row_round_trips_into_project() {
        let row = ProjectRow::new(
            "prj-1".into(),
            "docs".into(),
            "documentation".into(),
            "kb-hash-64".into(),
        );
        let project = row.into_project().unwrap();
        assert_eq!(project.id, "prj-1");
        assert_eq!(project.state, ProjectState::Active);
        assert!(project.metadata.is_empty());
    }

    #[test]
    fn corrupt_metadata_is_reported_not_swallowed() {
        let mut row = ProjectRow::new("p".into(), "n".into(), String::new(), "m".into());
        row.metadata_json = "{not json".into();
        assert!(matches!(row.into_project(), Err(DbError::CorruptRow(_))));
    }

    #[test]
    fn scope_encoding_round_trips() {
        let scopes = vec![ApiKeyScope::Read, ApiKeyScope::Write];
        let encoded = ApiKeyRow::encode_scopes(&scopes);
        assert_eq!(encoded, "read,write");

        let row = ApiKeyRow {
            key_id: "k".into(),
            project_id: "p".into(),
            hash: String::new(),
            salt: String::new(),
            scopes: encoded,
            expires_at: None,
            last_used_at: None,
            revoked: 0,
            created_at: 0,
        };
        assert_eq!(row.parsed_scopes().unwrap(), scopes);
    }

    #[test]
    fn unknown_scope_is_corrupt() {
        let row = ApiKeyRow {
            key_id: "k".into(),
            project_id: "p".into(),
            hash: String::new(),
            salt: String::new(),
            scopes: "read,superuser".into(),
            expires_at: None,
            last_used_at: None,
            revoked: 0,
            created_at: 0,
        };
        assert!(row.parsed_scopes().is_err());
    }
}
