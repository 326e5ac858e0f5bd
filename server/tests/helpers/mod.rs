//! Test harness for REST integration tests.
//!
//! Builds the real router over a fresh in-memory [`Database`] and drives
//! it with `tower::ServiceExt::oneshot` — no sockets, no subprocess.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

use vecbase_server::api::{router, AppContext};
use vecbase_server::db::Database;
use vecbase_server::model::IndexConfig;

pub struct TestApp {
    pub app: Router,
    pub db: Arc<Database>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_db(Arc::new(Database::new(IndexConfig::default())))
    }

    /// Wrap an existing database (used by the snapshot reload tests).
    pub fn with_db(db: Arc<Database>) -> Self {
        let ctx = AppContext { db: Arc::clone(&db), start_time: Instant::now() };
        Self { app: router(ctx), db }
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .expect("request build failed"),
            None => builder.body(Body::empty()).expect("request build failed"),
        };
        let response = self.app.clone().oneshot(request).await.expect("request failed");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body read failed").to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    // -----------------------------------------------------------------------
    // Common flows
    // -----------------------------------------------------------------------

    /// Create a library and return its id.
    pub async fn create_library(&self, body: Value) -> String {
        let (status, json) = self.request("POST", "/libraries", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "create library failed: {json}");
        json["id"].as_str().expect("library id").to_string()
    }

    /// Create a document in a library and return its id.
    pub async fn create_document(&self, lib: &str, body: Value) -> String {
        let (status, json) =
            self.request("POST", &format!("/libraries/{lib}/documents"), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "create document failed: {json}");
        json["id"].as_str().expect("document id").to_string()
    }

    /// Append chunks (array body) and return the created chunk ids.
    pub async fn add_chunks(&self, lib: &str, doc: &str, chunks: Value) -> Vec<String> {
        let (status, json) = self
            .request(
                "POST",
                &format!("/libraries/{lib}/documents/{doc}/chunks"),
                Some(chunks),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "append chunks failed: {json}");
        json.as_array()
            .expect("chunk array")
            .iter()
            .map(|c| c["id"].as_str().expect("chunk id").to_string())
            .collect()
    }

    /// Search one library and return the response body.
    pub async fn search(&self, lib: &str, body: Value) -> Value {
        let (status, json) =
            self.request("POST", &format!("/search/libraries/{lib}"), Some(body)).await;
        assert_eq!(status, StatusCode::OK, "search failed: {json}");
        json
    }
}

/// Embeddings of the result chunks, in rank order.
pub fn result_embeddings(response: &Value) -> Vec<Vec<f64>> {
    response["results"]
        .as_array()
        .expect("results array")
        .iter()
        .map(|r| {
            r["chunk"]["embedding"]
                .as_array()
                .expect("embedding")
                .iter()
                .map(|x| x.as_f64().unwrap())
                .collect()
        })
        .collect()
}

/// Chunk ids of the result chunks, in rank order.
pub fn result_ids(response: &Value) -> Vec<String> {
    response["results"]
        .as_array()
        .expect("results array")
        .iter()
        .map(|r| r["chunk"]["id"].as_str().unwrap().to_string())
        .collect()
}
