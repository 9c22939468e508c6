//! Shared fixture for service integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use asupersync::Cx;
use asupersync::runtime::{Runtime, RuntimeBuilder};
use knowledgebeast_core::{Config, IngestItem};
use knowledgebeast_search_core::MemoryVectorBackend;
use knowledgebeast_service::KnowledgeBase;
use tempfile::TempDir;

pub struct Fixture {
    pub kb: Arc<KnowledgeBase>,
    pub backend: Arc<MemoryVectorBackend>,
    pub rt: Runtime,
    pub cx: Cx,
    _dir: TempDir,
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(tweak: impl FnOnce(&mut Config)) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.database_url = format!("sqlite:///{}", dir.path().join("kb.sqlite3").display());
    config.rerank_model_id = Some("kb-token-overlap".to_string());
    // Fast breaker recovery keeps degraded-path tests quick.
    config.breaker_failure_threshold = 2;
    config.breaker_cooldown_seconds = 1;
    config.retry_max_attempts = 1;
    tweak(&mut config);

    let backend = Arc::new(MemoryVectorBackend::new());
    let kb = Arc::new(
        KnowledgeBase::new(config, Arc::clone(&backend) as _).expect("assemble knowledge base"),
    );
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    Fixture {
        kb,
        backend,
        rt,
        cx,
        _dir: dir,
    }
}

pub fn inline_doc(doc_id: Option<&str>, content: &str, content_type: &str) -> IngestItem {
    IngestItem {
        doc_id: doc_id.map(str::to_string),
        content: Some(content.to_string()),
        path: None,
        content_type: Some(content_type.to_string()),
        metadata: HashMap::new(),
    }
}
