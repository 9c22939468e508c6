//! Tenant isolation property: no query scoped to one project ever returns a
//! chunk created under another, across randomized insert/query workloads.

mod common;

use common::{fixture, inline_doc};
use knowledgebeast_core::{QueryMode, QueryRequest};
use proptest::prelude::*;

/// Per-project marker tokens; each document embeds its project's marker so a
/// cross-tenant leak is directly observable in result text.
const MARKERS: [&str; 3] = ["aardvark", "bandicoot", "wombat"];

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 8,
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_workloads_never_leak_across_projects(
        docs in proptest::collection::vec((0usize..3, 0u8..64), 1..12),
        query_modes in proptest::collection::vec(0usize..3, 1..6),
    ) {
        let f = fixture();
        f.rt.block_on(async {
            let mut projects = Vec::new();
            for (i, marker) in MARKERS.iter().enumerate() {
                let project = f
                    .kb
                    .create_project(&f.cx, &format!("tenant-{i}-{marker}"), "", Default::default(), None)
                    .await
                    .unwrap();
                projects.push(project);
            }

            for (project_idx, nonce) in &docs {
                let marker = MARKERS[*project_idx];
                let body = format!("{marker} payload number {nonce} with shared filler words");
                f.kb.ingest(
                    &f.cx,
                    &projects[*project_idx].id,
                    vec![inline_doc(None, &body, "text")],
                )
                .await
                .unwrap();
            }

            // Query every project for every *other* project's marker, in a
            // sampling of modes: zero results containing a foreign marker.
            for (qi, mode_idx) in query_modes.iter().enumerate() {
                let mode = [QueryMode::Vector, QueryMode::Keyword, QueryMode::Hybrid][*mode_idx];
                for (owner_idx, marker) in MARKERS.iter().enumerate() {
                    for (other_idx, other) in projects.iter().enumerate() {
                        if other_idx == owner_idx {
                            continue;
                        }
                        let mut request = QueryRequest::simple(format!("{marker} payload {qi}"));
                        request.mode = mode;
                        let out = f.kb.query(&f.cx, &other.id, &request).await.unwrap();
                        for item in &out.results {
                            prop_assert!(
                                !item.text.contains(marker),
                                "project {} leaked marker {} into project {}",
                                projects[owner_idx].id,
                                marker,
                                other.id
                            );
                        }
                    }
                }
            }
            Ok(())
        })?;
    }
}
