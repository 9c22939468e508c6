//! Project and API-key queries.
//!
//! All functions are async over `Cx` and return `Outcome` so cancellation
//! propagates intact through the db layer. Row decoding uses positional
//! column access against the exact SELECT lists defined here.

use asupersync::{Cx, Outcome};
use sqlmodel_core::{Error as SqlError, Row as SqlRow, Value};
use sqlmodel_query::{raw_execute, raw_query};

use knowledgebeast_core::now_micros;

use crate::error::DbError;
use crate::models::{ApiKeyRow, ProjectRow};
use crate::pool::DbPool;

fn map_sql_error(e: &SqlError) -> DbError {
    DbError::Sqlite(e.to_string())
}

fn map_sql_outcome<T>(out: Outcome<T, SqlError>) -> Outcome<T, DbError> {
    match out {
        Outcome::Ok(v) => Outcome::Ok(v),
        Outcome::Err(e) => Outcome::Err(map_sql_error(&e)),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Unwrap an `Outcome`, returning early on every non-`Ok` arm.
macro_rules! otry {
    ($out:expr) => {
        match $out {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

// =============================================================================
// Row decoding (positional)
// =============================================================================

fn get_text(row: &SqlRow, idx: usize) -> Result<String, DbError> {
    row.get(idx)
        .and_then(|v| match v {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        })
        .ok_or_else(|| DbError::CorruptRow(format!("missing text column {idx}")))
}

fn get_i64(row: &SqlRow, idx: usize) -> Result<i64, DbError> {
    row.get(idx)
        .and_then(|v| match v {
            Value::BigInt(n) => Some(*n),
            Value::Int(n) => Some(i64::from(*n)),
            _ => None,
        })
        .ok_or_else(|| DbError::CorruptRow(format!("missing integer column {idx}")))
}

fn get_opt_i64(row: &SqlRow, idx: usize) -> Option<i64> {
    row.get(idx).and_then(|v| match v {
        Value::BigInt(n) => Some(*n),
        Value::Int(n) => Some(i64::from(*n)),
        _ => None,
    })
}

const PROJECT_COLUMNS: &str =
    "id, name, description, embedding_model_id, created_at, updated_at, metadata_json, state";

fn decode_project_row(row: &SqlRow) -> Result<ProjectRow, DbError> {
    Ok(ProjectRow {
        id: get_text(row, 0)?,
        name: get_text(row, 1)?,
        description: get_text(row, 2)?,
        embedding_model_id: get_text(row, 3)?,
        created_at: get_i64(row, 4)?,
        updated_at: get_i64(row, 5)?,
        metadata_json: get_text(row, 6)?,
        state: get_text(row, 7)?,
    })
}

const API_KEY_COLUMNS: &str =
    "key_id, project_id, hash, salt, scopes, expires_at, last_used_at, revoked, created_at";

fn decode_api_key_row(row: &SqlRow) -> Result<ApiKeyRow, DbError> {
    Ok(ApiKeyRow {
        key_id: get_text(row, 0)?,
        project_id: get_text(row, 1)?,
        hash: get_text(row, 2)?,
        salt: get_text(row, 3)?,
        scopes: get_text(row, 4)?,
        expires_at: get_opt_i64(row, 5),
        last_used_at: get_opt_i64(row, 6),
        revoked: get_i64(row, 7)?,
        created_at: get_i64(row, 8)?,
    })
}

fn is_unique_violation(e: &DbError) -> bool {
    match e {
        DbError::Sqlite(msg) => msg.to_ascii_lowercase().contains("unique constraint failed"),
        _ => false,
    }
}

// =============================================================================
// Project queries
// =============================================================================

/// Insert a new project.
///
/// Duplicate names surface as `Duplicate`, including the race where another
/// writer inserts the same name between our existence check and the INSERT.
pub async fn create_project(cx: &Cx, pool: &DbPool, row: &ProjectRow) -> Outcome<ProjectRow, DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));

    let existing = otry!(map_sql_outcome(
        raw_query(
            cx,
            &*conn,
            "SELECT id FROM projects WHERE name = ?",
            &[Value::Text(row.name.clone())],
        )
        .await
    ));
    if !existing.is_empty() {
        return Outcome::Err(DbError::duplicate("project", row.name.clone()));
    }

    let insert = raw_execute(
        cx,
        &*conn,
        "INSERT INTO projects (id, name, description, embedding_model_id, created_at, updated_at, metadata_json, state) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        &[
            Value::Text(row.id.clone()),
            Value::Text(row.name.clone()),
            Value::Text(row.description.clone()),
            Value::Text(row.embedding_model_id.clone()),
            Value::BigInt(row.created_at),
            Value::BigInt(row.updated_at),
            Value::Text(row.metadata_json.clone()),
            Value::Text(row.state.clone()),
        ],
    )
    .await;

    match map_sql_outcome(insert) {
        Outcome::Ok(_) => Outcome::Ok(row.clone()),
        Outcome::Err(e) if is_unique_violation(&e) => {
            Outcome::Err(DbError::duplicate("project", row.name.clone()))
        }
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Fetch a project by id.
pub async fn get_project(cx: &Cx, pool: &DbPool, id: &str) -> Outcome<ProjectRow, DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let rows = otry!(map_sql_outcome(
        raw_query(
            cx,
            &*conn,
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"),
            &[Value::Text(id.to_string())],
        )
        .await
    ));
    match rows.first() {
        Some(row) => match decode_project_row(row) {
            Ok(decoded) => Outcome::Ok(decoded),
            Err(e) => Outcome::Err(e),
        },
        None => Outcome::Err(DbError::not_found("project", id)),
    }
}

/// List all projects, ordered by creation time then id for stable output.
pub async fn list_projects(cx: &Cx, pool: &DbPool) -> Outcome<Vec<ProjectRow>, DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let rows = otry!(map_sql_outcome(
        raw_query(
            cx,
            &*conn,
            &format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at ASC, id ASC"),
            &[],
        )
        .await
    ));
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        match decode_project_row(row) {
            Ok(decoded) => out.push(decoded),
            Err(e) => return Outcome::Err(e),
        }
    }
    Outcome::Ok(out)
}

/// Update mutable project fields and bump `updated_at`. Returns the fresh row.
pub async fn update_project(
    cx: &Cx,
    pool: &DbPool,
    id: &str,
    description: Option<&str>,
    metadata_json: Option<&str>,
) -> Outcome<ProjectRow, DbError> {
    let existing = otry!(get_project(cx, pool, id).await);
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));

    let description = description.unwrap_or(&existing.description);
    let metadata_json = metadata_json.unwrap_or(&existing.metadata_json);
    otry!(map_sql_outcome(
        raw_execute(
            cx,
            &*conn,
            "UPDATE projects SET description = ?, metadata_json = ?, updated_at = ? WHERE id = ?",
            &[
                Value::Text(description.to_string()),
                Value::Text(metadata_json.to_string()),
                Value::BigInt(now_micros()),
                Value::Text(id.to_string()),
            ],
        )
        .await
    ));
    drop(conn);
    get_project(cx, pool, id).await
}

/// Move a project between `active` and `deleting`.
pub async fn set_project_state(
    cx: &Cx,
    pool: &DbPool,
    id: &str,
    state: &str,
) -> Outcome<(), DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let affected = otry!(map_sql_outcome(
        raw_execute(
            cx,
            &*conn,
            "UPDATE projects SET state = ?, updated_at = ? WHERE id = ?",
            &[
                Value::Text(state.to_string()),
                Value::BigInt(now_micros()),
                Value::Text(id.to_string()),
            ],
        )
        .await
    ));
    if affected == 0 {
        return Outcome::Err(DbError::not_found("project", id));
    }
    Outcome::Ok(())
}

/// Delete the project record and its API keys. Idempotent: deleting an
/// absent project succeeds.
pub async fn delete_project_record(cx: &Cx, pool: &DbPool, id: &str) -> Outcome<(), DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    otry!(map_sql_outcome(
        raw_execute(
            cx,
            &*conn,
            "DELETE FROM api_keys WHERE project_id = ?",
            &[Value::Text(id.to_string())],
        )
        .await
    ));
    otry!(map_sql_outcome(
        raw_execute(
            cx,
            &*conn,
            "DELETE FROM projects WHERE id = ?",
            &[Value::Text(id.to_string())],
        )
        .await
    ));
    Outcome::Ok(())
}

// =============================================================================
// API-key queries
// =============================================================================

/// Insert a new API key row.
pub async fn insert_api_key(cx: &Cx, pool: &DbPool, row: &ApiKeyRow) -> Outcome<(), DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let insert = raw_execute(
        cx,
        &*conn,
        "INSERT INTO api_keys (key_id, project_id, hash, salt, scopes, expires_at, last_used_at, revoked, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        &[
            Value::Text(row.key_id.clone()),
            Value::Text(row.project_id.clone()),
            Value::Text(row.hash.clone()),
            Value::Text(row.salt.clone()),
            Value::Text(row.scopes.clone()),
            row.expires_at.map_or(Value::Null, Value::BigInt),
            row.last_used_at.map_or(Value::Null, Value::BigInt),
            Value::BigInt(row.revoked),
            Value::BigInt(row.created_at),
        ],
    )
    .await;
    match map_sql_outcome(insert) {
        Outcome::Ok(_) => Outcome::Ok(()),
        Outcome::Err(e) if is_unique_violation(&e) => {
            Outcome::Err(DbError::duplicate("api key", row.key_id.clone()))
        }
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Fetch an API key by id.
pub async fn get_api_key(cx: &Cx, pool: &DbPool, key_id: &str) -> Outcome<ApiKeyRow, DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let rows = otry!(map_sql_outcome(
        raw_query(
            cx,
            &*conn,
            &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_id = ?"),
            &[Value::Text(key_id.to_string())],
        )
        .await
    ));
    match rows.first() {
        Some(row) => match decode_api_key_row(row) {
            Ok(decoded) => Outcome::Ok(decoded),
            Err(e) => Outcome::Err(e),
        },
        None => Outcome::Err(DbError::not_found("api key", key_id)),
    }
}

/// List keys for a project, newest first.
pub async fn list_api_keys(
    cx: &Cx,
    pool: &DbPool,
    project_id: &str,
) -> Outcome<Vec<ApiKeyRow>, DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let rows = otry!(map_sql_outcome(
        raw_query(
            cx,
            &*conn,
            &format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE project_id = ? \
                 ORDER BY created_at DESC, key_id ASC"
            ),
            &[Value::Text(project_id.to_string())],
        )
        .await
    ));
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        match decode_api_key_row(row) {
            Ok(decoded) => out.push(decoded),
            Err(e) => return Outcome::Err(e),
        }
    }
    Outcome::Ok(out)
}

/// Mark a key revoked. Returns whether a row was affected.
pub async fn revoke_api_key(cx: &Cx, pool: &DbPool, key_id: &str) -> Outcome<bool, DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    let affected = otry!(map_sql_outcome(
        raw_execute(
            cx,
            &*conn,
            "UPDATE api_keys SET revoked = 1 WHERE key_id = ?",
            &[Value::Text(key_id.to_string())],
        )
        .await
    ));
    Outcome::Ok(affected > 0)
}

/// Liveness probe for the persistent store.
pub async fn ping(cx: &Cx, pool: &DbPool) -> Outcome<(), DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    otry!(map_sql_outcome(raw_query(cx, &*conn, "SELECT 1", &[]).await));
    Outcome::Ok(())
}

/// Best-effort `last_used_at` bump; failures are the caller's to ignore.
pub async fn touch_api_key(cx: &Cx, pool: &DbPool, key_id: &str) -> Outcome<(), DbError> {
    let conn = otry!(map_sql_outcome(pool.acquire(cx).await));
    otry!(map_sql_outcome(
        raw_execute(
            cx,
            &*conn,
            "UPDATE api_keys SET last_used_at = ? WHERE key_id = ?",
            &[
                Value::BigInt(now_micros()),
                Value::Text(key_id.to_string()),
            ],
        )
        .await
    ));
    Outcome::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbPoolConfig;
    use asupersync::runtime::RuntimeBuilder;
    use tempfile::tempdir;

    fn test_pool(name: &str) -> (tempfile::TempDir, DbPool) {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join(format!("{name}.sqlite3"));
        let cfg = DbPoolConfig {
            database_url: format!("sqlite:///{}", db_path.display()),
            min_connections: 1,
            max_connections: 2,
            ..DbPoolConfig::default()
        };
        let pool = crate::create_pool(&cfg).expect("create pool");
        (dir, pool)
    }

    fn project_row(id: &str, name: &str) -> ProjectRow {
        ProjectRow::new(
            id.to_string(),
            name.to_string(),
            "test project".to_string(),
            "kb-hash-64".to_string(),
        )
    }

    #[test]
    fn project_crud_round_trip() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let (_dir, pool) = test_pool("project_crud");

        rt.block_on(async {
            let created = create_project(&cx, &pool, &project_row("p1", "docs"))
                .await
                .into_result()
                .expect("create");
            assert_eq!(created.id, "p1");

            let fetched = get_project(&cx, &pool, "p1")
                .await
                .into_result()
                .expect("get");
            assert_eq!(fetched.name, "docs");
            assert_eq!(fetched.state, "active");

            let all = list_projects(&cx, &pool).await.into_result().expect("list");
            assert_eq!(all.len(), 1);

            let updated = update_project(&cx, &pool, "p1", Some("fresh words"), None)
                .await
                .into_result()
                .expect("update");
            assert_eq!(updated.description, "fresh words");
            assert!(updated.updated_at >= created.updated_at);

            delete_project_record(&cx, &pool, "p1")
                .await
                .into_result()
                .expect("delete");
            assert!(get_project(&cx, &pool, "p1").await.into_result().is_err());

            // Idempotent: deleting again succeeds.
            delete_project_record(&cx, &pool, "p1")
                .await
                .into_result()
                .expect("re-delete");
        });
    }

    #[test]
    fn duplicate_project_name_is_a_conflict() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let (_dir, pool) = test_pool("dup_name");

        rt.block_on(async {
            create_project(&cx, &pool, &project_row("p1", "docs"))
                .await
                .into_result()
                .expect("first create");
            let err = create_project(&cx, &pool, &project_row("p2", "docs"))
                .await
                .into_result()
                .expect_err("second create must fail");
            assert!(matches!(err, DbError::Duplicate { .. }));
        });
    }

    #[test]
    fn api_key_lifecycle() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let (_dir, pool) = test_pool("api_keys");

        rt.block_on(async {
            create_project(&cx, &pool, &project_row("p1", "docs"))
                .await
                .into_result()
                .expect("create project");

            let row = ApiKeyRow {
                key_id: "key-1".to_string(),
                project_id: "p1".to_string(),
                hash: "deadbeef".to_string(),
                salt: "cafe".to_string(),
                scopes: "read,write".to_string(),
                expires_at: None,
                last_used_at: None,
                revoked: 0,
                created_at: now_micros(),
            };
            insert_api_key(&cx, &pool, &row)
                .await
                .into_result()
                .expect("insert key");

            let fetched = get_api_key(&cx, &pool, "key-1")
                .await
                .into_result()
                .expect("get key");
            assert_eq!(fetched.project_id, "p1");
            assert!(!fetched.is_revoked());
            assert!(fetched.expires_at.is_none());

            let listed = list_api_keys(&cx, &pool, "p1")
                .await
                .into_result()
                .expect("list keys");
            assert_eq!(listed.len(), 1);

            assert!(revoke_api_key(&cx, &pool, "key-1")
                .await
                .into_result()
                .expect("revoke"));
            let revoked = get_api_key(&cx, &pool, "key-1")
                .await
                .into_result()
                .expect("get revoked");
            assert!(revoked.is_revoked());

            touch_api_key(&cx, &pool, "key-1")
                .await
                .into_result()
                .expect("touch");
            let touched = get_api_key(&cx, &pool, "key-1")
                .await
                .into_result()
                .expect("get touched");
            assert!(touched.last_used_at.is_some());
        });
    }

    #[test]
    fn project_delete_purges_its_keys() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        let (_dir, pool) = test_pool("delete_purges_keys");

        rt.block_on(async {
            create_project(&cx, &pool, &project_row("p1", "docs"))
                .await
                .into_result()
                .expect("create project");
            let row = ApiKeyRow {
                key_id: "key-1".to_string(),
                project_id: "p1".to_string(),
                hash: String::new(),
                salt: String::new(),
                scopes: "read".to_string(),
                expires_at: None,
                last_used_at: None,
                revoked: 0,
                created_at: now_micros(),
            };
            insert_api_key(&cx, &pool, &row)
                .await
                .into_result()
                .expect("insert key");

            delete_project_record(&cx, &pool, "p1")
                .await
                .into_result()
                .expect("delete project");
            assert!(get_api_key(&cx, &pool, "key-1").await.into_result().is_err());
        });
    }
}
