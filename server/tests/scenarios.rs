//! End-to-end scenarios through the REST surface: basis-vector ranking on
//! each exact index, metadata filtering, cross-library search, and
//! snapshot reload equivalence.

mod helpers;

use helpers::{result_embeddings, result_ids, TestApp};
use serde_json::json;
use std::sync::Arc;

use vecbase_server::model::IndexConfig;
use vecbase_server::snapshot;

/// Shared setup: library "L1", document "D1", three basis-vector chunks.
async fn basis_fixture(index_kind: &str) -> (TestApp, String, String) {
    let app = TestApp::new();
    let lib = app
        .create_library(json!({ "name": "L1", "index_kind": index_kind }))
        .await;
    let doc = app.create_document(&lib, json!({ "name": "D1" })).await;
    app.add_chunks(
        &lib,
        &doc,
        json!([
            { "text": "x axis", "embedding": [1.0, 0.0, 0.0] },
            { "text": "y axis", "embedding": [0.0, 1.0, 0.0] },
            { "text": "z axis", "embedding": [0.0, 0.0, 1.0] },
        ]),
    )
    .await;
    (app, lib, doc)
}

// ---------------------------------------------------------------------------
// S1/S2: exact ranking on linear and kd-tree
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_index_ranks_basis_vectors() {
    let (app, lib, _) = basis_fixture("linear").await;

    let (status, _) =
        app.request("POST", &format!("/libraries/{lib}/index?kind=linear"), None).await;
    assert_eq!(status, 200);

    let response = app
        .search(&lib, json!({ "query_embedding": [0.9, 0.1, 0.0], "k": 2 }))
        .await;
    let embeddings = result_embeddings(&response);
    assert_eq!(embeddings.len(), 2);
    assert_eq!(embeddings[0], vec![1.0, 0.0, 0.0]);
    assert_eq!(embeddings[1], vec![0.0, 1.0, 0.0]);
}

#[tokio::test]
async fn kdtree_index_matches_the_linear_ranking() {
    let (app, lib, _) = basis_fixture("kdtree").await;

    let (status, stats) =
        app.request("POST", &format!("/libraries/{lib}/index?kind=kdtree"), None).await;
    assert_eq!(status, 200);
    assert_eq!(stats["kind"], "kdtree");

    let response = app
        .search(&lib, json!({ "query_embedding": [0.9, 0.1, 0.0], "k": 2 }))
        .await;
    let embeddings = result_embeddings(&response);
    assert_eq!(embeddings[0], vec![1.0, 0.0, 0.0]);
    assert_eq!(embeddings[1], vec![0.0, 1.0, 0.0]);
}

// ---------------------------------------------------------------------------
// S3: metadata filtering on top of similarity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filtered_search_returns_exactly_the_tagged_chunk() {
    let (app, lib, doc) = basis_fixture("linear").await;
    let tagged = app
        .add_chunks(
            &lib,
            &doc,
            json!([{
                "text": "intro copy",
                "embedding": [1.0, 0.0, 0.0],
                "metadata": { "section": "intro" },
            }]),
        )
        .await;

    let response = app
        .search(
            &lib,
            json!({
                "query_embedding": [1.0, 0.0, 0.0],
                "k": 3,
                "filters": { "section": { "eq": "intro" } },
            }),
        )
        .await;
    let ids = result_ids(&response);
    assert_eq!(ids, tagged, "only the tagged chunk may come back");
}

// ---------------------------------------------------------------------------
// Cross-library search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn multi_library_search_merges_by_distance() {
    let app = TestApp::new();
    let lib_a = app.create_library(json!({ "name": "A" })).await;
    let lib_b = app.create_library(json!({ "name": "B" })).await;
    let doc_a = app.create_document(&lib_a, json!({ "name": "D" })).await;
    let doc_b = app.create_document(&lib_b, json!({ "name": "D" })).await;
    app.add_chunks(&lib_a, &doc_a, json!([{ "text": "far", "embedding": [0.0, 1.0] }]))
        .await;
    let near = app
        .add_chunks(&lib_b, &doc_b, json!([{ "text": "near", "embedding": [0.9, 0.1] }]))
        .await;

    let (status, response) = app
        .request(
            "POST",
            "/search/libraries",
            Some(json!({
                "query_embedding": [1.0, 0.0],
                "k": 1,
                "library_ids": [lib_a, lib_b],
            })),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(result_ids(&response), near);
}

// ---------------------------------------------------------------------------
// S6: snapshot save, reload, identical answers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reloaded_snapshot_answers_like_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let (app, lib, doc) = basis_fixture("kdtree").await;
    app.add_chunks(
        &lib,
        &doc,
        json!([{ "text": "diag", "embedding": [0.6, 0.6, 0.0] }]),
    )
    .await;
    let query = json!({ "query_embedding": [0.9, 0.2, 0.0], "k": 3 });
    let before = result_ids(&app.search(&lib, query.clone()).await);

    snapshot::save(&app.db, &path).unwrap();

    let reloaded = snapshot::load(&path, IndexConfig::default()).unwrap();
    let app2 = TestApp::with_db(Arc::new(reloaded));
    let after = result_ids(&app2.search(&lib, query).await);
    assert_eq!(before, after, "reloaded store must rank identically after rebuild");

    // Entity listing survives too.
    let (status, libraries) = app2.request("GET", "/libraries", None).await;
    assert_eq!(status, 200);
    assert_eq!(libraries.as_array().unwrap().len(), 1);
    assert_eq!(libraries[0]["id"].as_str().unwrap(), lib);
}
