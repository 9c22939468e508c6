//! Core types for KnowledgeBeast.
//!
//! This crate is the shared foundation for every other KnowledgeBeast crate:
//! configuration, the error taxonomy, domain models (projects, documents,
//! chunks, API keys, query requests/responses), lock-free metrics, and
//! timestamp helpers.
//!
//! It deliberately has no I/O dependencies so that all crates can depend on
//! it without pulling in the async runtime or the database driver.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod timestamps;

pub use config::Config;
pub use error::{KbError, KbResult};
pub use metrics::{KbMetrics, global_metrics};
pub use models::{
    ApiKeyRecord, ApiKeyScope, Chunk, ComponentHealth, ContentType, DocumentMeta, HealthReport,
    HealthStatus, IngestItem, IngestItemOutcome, IngestResponse, Project, ProjectState, QueryMode,
    QueryRequest, QueryResponse, QueryResultItem,
};
pub use timestamps::{micros_to_iso, now_micros};
