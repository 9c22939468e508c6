//! SQLite persistence for KnowledgeBeast.
//!
//! Stores the two durable tables — project records and hashed API keys —
//! behind a pooled `sqlmodel` connection. Everything else (vector
//! collections, keyword index, caches) lives in the serving process or the
//! external vector backend and is rebuilt or re-created from these records.

#![forbid(unsafe_code)]

pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use error::{DbError, DbResult};
pub use models::{ApiKeyRow, ProjectRow};
pub use pool::{DbConn, DbPool, DbPoolConfig, create_pool};
