//! End-to-end scenarios through the serving facade.

mod common;

use common::{fixture, inline_doc};
use knowledgebeast_core::{ApiKeyScope, KbError, QueryMode, QueryRequest};
use knowledgebeast_service::StreamEvent;

#[test]
fn markdown_ingest_then_hybrid_query_finds_the_passage() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "docs", "", Default::default(), None)
            .await
            .unwrap();

        let resp = f
            .kb
            .ingest(
                &f.cx,
                &project.id,
                vec![inline_doc(None, "# Install\n\npip install foo", "markdown")],
            )
            .await
            .unwrap();
        assert_eq!(resp.accepted, 1);
        assert_eq!(resp.failed, 0);

        let mut request = QueryRequest::simple("install");
        request.top_k = 5;
        request.mode = QueryMode::Hybrid;
        let out = f.kb.query(&f.cx, &project.id, &request).await.unwrap();
        assert!(!out.degraded);
        assert!(!out.results.is_empty());
        assert!(
            out.results.iter().any(|r| r.text.contains("pip install foo")),
            "expected the markdown body to be retrievable"
        );
    });
}

#[test]
fn hybrid_degrades_to_keyword_when_vector_backend_stops() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "docs", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(
            &f.cx,
            &project.id,
            vec![inline_doc(None, "# Install\n\npip install foo", "markdown")],
        )
        .await
        .unwrap();

        f.backend.set_unavailable(true);
        let mut request = QueryRequest::simple("install");
        request.mode = QueryMode::Hybrid;
        let out = f.kb.query(&f.cx, &project.id, &request).await.unwrap();
        assert!(out.degraded);
        assert!(!out.results.is_empty(), "keyword stream must still serve");
    });
}

#[test]
fn vector_mode_fails_with_backend_unavailable_when_down() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "docs", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(
            &f.cx,
            &project.id,
            vec![inline_doc(None, "pip install foo", "text")],
        )
        .await
        .unwrap();

        f.backend.set_unavailable(true);
        let mut request = QueryRequest::simple("install");
        request.mode = QueryMode::Vector;
        let err = f.kb.query(&f.cx, &project.id, &request).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert!(matches!(err, KbError::BackendUnavailable(_)));

        // Keep hammering until the breaker opens; the external mapping must
        // stay the same 503 with no backend contact.
        for _ in 0..3 {
            let _ = f.kb.query(&f.cx, &project.id, &request).await;
        }
        let err = f.kb.query(&f.cx, &project.id, &request).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    });
}

#[test]
fn rapid_ingest_generates_distinct_doc_ids() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "docs", "", Default::default(), None)
            .await
            .unwrap();
        let resp = f
            .kb
            .ingest(
                &f.cx,
                &project.id,
                vec![
                    inline_doc(None, "alpha document body", "text"),
                    inline_doc(None, "beta document body", "text"),
                    inline_doc(None, "gamma document body", "text"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(resp.accepted, 3);
        let mut ids: Vec<&str> = resp.outcomes.iter().map(|o| o.doc_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "doc ids must be unique even within one millisecond");
    });
}

#[test]
fn projects_are_isolated() {
    let f = fixture();
    f.rt.block_on(async {
        let a = f
            .kb
            .create_project(&f.cx, "project-a", "", Default::default(), None)
            .await
            .unwrap();
        let b = f
            .kb
            .create_project(&f.cx, "project-b", "", Default::default(), None)
            .await
            .unwrap();

        f.kb.ingest(
            &f.cx,
            &a.id,
            vec![inline_doc(None, "the alpha-secret launch codes", "text")],
        )
        .await
        .unwrap();

        let request = QueryRequest::simple("alpha-secret");
        let out = f.kb.query(&f.cx, &b.id, &request).await.unwrap();
        assert!(out.results.is_empty(), "project B must never see project A's chunks");

        let out = f.kb.query(&f.cx, &a.id, &request).await.unwrap();
        assert!(!out.results.is_empty());
    });
}

#[test]
fn empty_query_returns_empty_in_every_mode() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "docs", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(&f.cx, &project.id, vec![inline_doc(None, "content", "text")])
            .await
            .unwrap();

        for mode in [QueryMode::Vector, QueryMode::Keyword, QueryMode::Hybrid] {
            let mut request = QueryRequest::simple("");
            request.mode = mode;
            let out = f.kb.query(&f.cx, &project.id, &request).await.unwrap();
            assert!(out.results.is_empty());
            assert!(!out.degraded);
        }
    });
}

#[test]
fn create_delete_create_yields_an_empty_project() {
    let f = fixture();
    f.rt.block_on(async {
        let first = f
            .kb
            .create_project(&f.cx, "recycled", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(&f.cx, &first.id, vec![inline_doc(None, "old content here", "text")])
            .await
            .unwrap();
        f.kb.delete_project(&f.cx, &first.id).await.unwrap();

        // Same name is free again; the new project starts empty.
        let second = f
            .kb
            .create_project(&f.cx, "recycled", "", Default::default(), None)
            .await
            .unwrap();
        let out = f
            .kb
            .query(&f.cx, &second.id, &QueryRequest::simple("old content"))
            .await
            .unwrap();
        assert!(out.results.is_empty());

        // Delete is idempotent.
        f.kb.delete_project(&f.cx, &first.id).await.unwrap();
    });
}

#[test]
fn ingest_then_delete_restores_pre_ingest_state() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "docs", "", Default::default(), None)
            .await
            .unwrap();
        let resp = f
            .kb
            .ingest(
                &f.cx,
                &project.id,
                vec![inline_doc(Some("doc-x"), "unique zanzibar content", "text")],
            )
            .await
            .unwrap();
        assert_eq!(resp.accepted, 1);

        // Visible in both streams before the delete.
        let mut request = QueryRequest::simple("zanzibar");
        request.mode = QueryMode::Keyword;
        assert!(!f.kb.query(&f.cx, &project.id, &request).await.unwrap().results.is_empty());
        request.mode = QueryMode::Vector;
        assert!(!f.kb.query(&f.cx, &project.id, &request).await.unwrap().results.is_empty());

        f.kb.delete_document(&f.cx, &project.id, "doc-x").await.unwrap();

        // Use a fresh query string so the semantic cache cannot answer.
        let mut request = QueryRequest::simple("zanzibar content");
        request.mode = QueryMode::Keyword;
        assert!(f.kb.query(&f.cx, &project.id, &request).await.unwrap().results.is_empty());
        request.mode = QueryMode::Vector;
        assert!(f.kb.query(&f.cx, &project.id, &request).await.unwrap().results.is_empty());
    });
}

#[test]
fn export_import_round_trip_preserves_query_results() {
    let request = QueryRequest::simple("install foo");

    let f = fixture();
    let (before, archive) = f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "exported", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(
            &f.cx,
            &project.id,
            vec![
                inline_doc(Some("doc-1"), "pip install foo", "text"),
                inline_doc(Some("doc-2"), "configure foo afterwards", "text"),
            ],
        )
        .await
        .unwrap();

        let before = f.kb.query(&f.cx, &project.id, &request).await.unwrap();
        let archive = f.kb.export_project(&f.cx, &project.id).await.unwrap();
        (before, archive)
    });

    // Import into a fresh instance.
    let g = fixture();
    let after = g.rt.block_on(async {
        let imported = g.kb.import_project(&g.cx, archive).await.unwrap();
        g.kb.query(&g.cx, &imported.id, &request).await.unwrap()
    });

    let before_ids: Vec<&str> = before.results.iter().map(|r| r.chunk_id.as_str()).collect();
    let after_ids: Vec<&str> = after.results.iter().map(|r| r.chunk_id.as_str()).collect();
    assert_eq!(before_ids, after_ids);
}

#[test]
fn api_key_scopes_are_enforced() {
    let f = fixture();
    f.rt.block_on(async {
        let a = f
            .kb
            .create_project(&f.cx, "secured", "", Default::default(), None)
            .await
            .unwrap();
        let b = f
            .kb
            .create_project(&f.cx, "other", "", Default::default(), None)
            .await
            .unwrap();

        let (record, plaintext) = f
            .kb
            .create_api_key(&f.cx, &a.id, &[ApiKeyScope::Read], None)
            .await
            .unwrap();

        // Valid for reads on its own project.
        f.kb.authenticate(&f.cx, &plaintext, &a.id, ApiKeyScope::Read)
            .await
            .unwrap();

        // Insufficient scope → Forbidden.
        let err = f
            .kb
            .authenticate(&f.cx, &plaintext, &a.id, ApiKeyScope::Write)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        // Wrong project → Forbidden.
        let err = f
            .kb
            .authenticate(&f.cx, &plaintext, &b.id, ApiKeyScope::Read)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        // Garbage → Unauthenticated.
        let err = f
            .kb
            .authenticate(&f.cx, "kb_bogus_key", &a.id, ApiKeyScope::Read)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);

        // Revoked → Unauthenticated.
        f.kb.revoke_api_key(&f.cx, &a.id, &record.key_id).await.unwrap();
        let err = f
            .kb
            .authenticate(&f.cx, &plaintext, &a.id, ApiKeyScope::Read)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    });
}

#[test]
fn semantic_cache_answers_repeated_queries() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "cached", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(&f.cx, &project.id, vec![inline_doc(None, "pip install foo", "text")])
            .await
            .unwrap();

        let request = QueryRequest::simple("install foo");
        let first = f.kb.query(&f.cx, &project.id, &request).await.unwrap();
        assert!(!first.cache_hit);

        let second = f.kb.query(&f.cx, &project.id, &request).await.unwrap();
        assert!(second.cache_hit);
        let first_ids: Vec<&str> = first.results.iter().map(|r| r.chunk_id.as_str()).collect();
        let second_ids: Vec<&str> = second.results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    });
}

#[test]
fn query_stream_emits_results_then_done() {
    let f = fixture();
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "streamed", "", Default::default(), None)
            .await
            .unwrap();
        f.kb.ingest(&f.cx, &project.id, vec![inline_doc(None, "pip install foo", "text")])
            .await
            .unwrap();

        let events = f
            .kb
            .query_stream(&f.cx, &project.id, &QueryRequest::simple("install"))
            .await
            .unwrap();
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
        let result_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Result { .. }))
            .count();
        assert!(result_count >= 1);
        // Results arrive in rank order.
        let ranks: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Result { rank, .. } => Some(*rank),
                _ => None,
            })
            .collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(ranks, sorted);
    });
}

#[test]
fn quota_rejects_over_limit_documents() {
    let f = common::fixture_with(|config| {
        config.quota_max_documents = 1;
    });
    f.rt.block_on(async {
        let project = f
            .kb
            .create_project(&f.cx, "tiny", "", Default::default(), None)
            .await
            .unwrap();

        let first = f
            .kb
            .ingest(&f.cx, &project.id, vec![inline_doc(Some("d1"), "first body", "text")])
            .await
            .unwrap();
        assert_eq!(first.accepted, 1);

        let second = f
            .kb
            .ingest(&f.cx, &project.id, vec![inline_doc(Some("d2"), "second body", "text")])
            .await
            .unwrap();
        assert_eq!(second.accepted, 0);
        assert_eq!(second.failed, 1);
        assert_eq!(
            second.outcomes[0].error_type.as_deref(),
            Some("QUOTA_EXCEEDED")
        );

        // Re-ingesting the existing document is a replacement, not growth.
        let replace = f
            .kb
            .ingest(&f.cx, &project.id, vec![inline_doc(Some("d1"), "fresh body", "text")])
            .await
            .unwrap();
        assert_eq!(replace.accepted, 1);
    });
}
