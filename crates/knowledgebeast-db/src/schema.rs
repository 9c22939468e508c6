//! Database schema creation.
//!
//! All statements are idempotent (`IF NOT EXISTS`), so schema init can run
//! on every fresh connection without coordination.

/// Per-connection PRAGMAs: WAL for concurrent readers, a generous busy
/// timeout so short write contention does not surface as errors.
pub const PRAGMA_INIT_SQL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 15000;
PRAGMA foreign_keys = ON;
";

/// Table and index DDL.
pub const CREATE_TABLES_SQL: &str = r"
-- Projects table
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    embedding_model_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    state TEXT NOT NULL DEFAULT 'active'
);
CREATE INDEX IF NOT EXISTS idx_projects_name ON projects(name);
CREATE INDEX IF NOT EXISTS idx_projects_state ON projects(state);

-- API keys table
CREATE TABLE IF NOT EXISTS api_keys (
    key_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    hash TEXT NOT NULL,
    salt TEXT NOT NULL,
    scopes TEXT NOT NULL,
    expires_at INTEGER,
    last_used_at INTEGER,
    revoked INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_api_keys_project ON api_keys(project_id);
";

/// Full init script: PRAGMAs followed by DDL.
#[must_use]
pub fn init_sql() -> String {
    format!("{PRAGMA_INIT_SQL}\n{CREATE_TABLES_SQL}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_is_idempotent_by_construction() {
        let sql = init_sql();
        assert!(sql.contains("IF NOT EXISTS"));
        assert!(sql.contains("journal_mode = WAL"));
        // Every CREATE carries the guard.
        for stmt in sql.split(';').filter(|s| s.contains("CREATE")) {
            assert!(stmt.contains("IF NOT EXISTS"), "unguarded CREATE: {stmt}");
        }
    }
}
