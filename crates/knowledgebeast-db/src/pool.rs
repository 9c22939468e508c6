//! Connection pool configuration and initialization.
//!
//! Wraps `sqlmodel_pool::Pool` over the C-backed `SQLite` driver. Every new
//! connection runs the idempotent init script (PRAGMAs + DDL), so the first
//! acquire on a fresh database file also creates the schema.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use sqlmodel_core::Error as SqlError;
use sqlmodel_pool::{Pool, PoolConfig, PooledConnection};

use crate::error::{DbError, DbResult};
use crate::schema;

/// The connection type used by this crate's pool and queries.
pub type DbConn = sqlmodel_sqlite::SqliteConnection;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    /// Database URL (`sqlite:///path/to/db.sqlite3` or `:memory:`).
    pub database_url: String,
    /// Minimum connections kept open.
    pub min_connections: usize,
    /// Maximum connections.
    pub max_connections: usize,
    /// Timeout for acquiring a connection (ms).
    pub acquire_timeout_ms: u64,
    /// Max connection lifetime (ms).
    pub max_lifetime_ms: u64,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///./knowledgebeast.sqlite3".to_string(),
            min_connections: 2,
            max_connections: 16,
            acquire_timeout_ms: 15_000,
            max_lifetime_ms: 30 * 60 * 1000,
        }
    }
}

impl DbPoolConfig {
    /// Config for a given URL with default sizing.
    #[must_use]
    pub fn for_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Resolve the filesystem path (or `:memory:`) from the database URL.
    ///
    /// # Errors
    /// `InvalidArgument` for URL schemes other than `sqlite`.
    pub fn sqlite_path(&self) -> DbResult<String> {
        let url = self.database_url.trim();
        if url == ":memory:" || url == "sqlite://:memory:" || url == "sqlite:///:memory:" {
            return Ok(":memory:".to_string());
        }
        url.strip_prefix("sqlite:///")
            .map(str::to_string)
            .ok_or_else(|| DbError::InvalidArgument {
                field: "database_url",
                message: format!("expected sqlite:///<path> or :memory:, got {url:?}"),
            })
    }
}

/// A configured `SQLite` connection pool with schema initialization.
#[derive(Clone)]
pub struct DbPool {
    pool: Arc<Pool<DbConn>>,
    sqlite_path: String,
    init_sql: Arc<String>,
}

impl DbPool {
    /// Create a new pool. Connections open lazily on first acquire; the
    /// parent directory for file-backed databases is created eagerly.
    ///
    /// # Errors
    /// `InvalidArgument` for bad URLs, `Internal` when the parent directory
    /// cannot be created.
    pub fn new(config: &DbPoolConfig) -> DbResult<Self> {
        let sqlite_path = config.sqlite_path()?;
        if sqlite_path != ":memory:"
            && let Some(parent) = std::path::Path::new(&sqlite_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Internal(format!("create database dir {}: {e}", parent.display()))
            })?;
        }

        let pool_config = PoolConfig::new(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout_ms)
            .max_lifetime(config.max_lifetime_ms)
            .test_on_checkout(true)
            .test_on_return(false);

        Ok(Self {
            pool: Arc::new(Pool::new(pool_config)),
            sqlite_path,
            init_sql: Arc::new(schema::init_sql()),
        })
    }

    #[must_use]
    pub fn sqlite_path(&self) -> &str {
        &self.sqlite_path
    }

    /// Acquire a pooled connection, opening and initializing a new one when
    /// the idle set is empty.
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<DbConn>, SqlError> {
        let sqlite_path = self.sqlite_path.clone();
        let init_sql = Arc::clone(&self.init_sql);

        self.pool
            .acquire(cx, || {
                let sqlite_path = sqlite_path.clone();
                let init_sql = Arc::clone(&init_sql);
                async move {
                    let conn = if sqlite_path == ":memory:" {
                        match DbConn::open_memory() {
                            Ok(c) => c,
                            Err(e) => return Outcome::Err(e),
                        }
                    } else {
                        match DbConn::open_file(sqlite_path.clone()) {
                            Ok(c) => c,
                            Err(e) => return Outcome::Err(e),
                        }
                    };

                    // Idempotent init: PRAGMAs + CREATE IF NOT EXISTS.
                    if let Err(e) = conn.execute_raw(&init_sql) {
                        return Outcome::Err(e);
                    }
                    Outcome::Ok(conn)
                }
            })
            .await
    }
}

/// Create a pool for `config`.
///
/// # Errors
/// See [`DbPool::new`].
pub fn create_pool(config: &DbPoolConfig) -> DbResult<DbPool> {
    DbPool::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_path_parses_file_urls() {
        let cfg = DbPoolConfig::for_url("sqlite:///tmp/kb/test.sqlite3");
        assert_eq!(cfg.sqlite_path().unwrap(), "tmp/kb/test.sqlite3");
    }

    #[test]
    fn sqlite_path_accepts_memory_forms() {
        for url in [":memory:", "sqlite://:memory:", "sqlite:///:memory:"] {
            let cfg = DbPoolConfig::for_url(url);
            assert_eq!(cfg.sqlite_path().unwrap(), ":memory:");
        }
    }

    #[test]
    fn non_sqlite_urls_are_rejected() {
        let cfg = DbPoolConfig::for_url("postgres://localhost/kb");
        assert!(cfg.sqlite_path().is_err());
    }
}
