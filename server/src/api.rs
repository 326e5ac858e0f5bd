//! HTTP API handlers.
//!
//! Thin translations between REST requests and [`Database`] operations:
//! extract, validate the parts serde cannot, call the core, map the error
//! kind to a status code. No handler holds state of its own and none calls
//! out of process, so nothing here ever blocks a library lock on external
//! work.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;
use uuid::Uuid;

use vecbase_core::db::{Database, LibraryStats, LibraryUpdate, SearchHit};
use vecbase_core::error::Error;
use vecbase_core::filter::{Filter, Metadata};
use vecbase_core::index::IndexStats;
use vecbase_core::model::{Chunk, Document, IndexKind, Library, LshParams};
use vecbase_core::store::ChunkInput;

// ---------------------------------------------------------------------------
// Application state and error mapping
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppContext {
    pub db: Arc<Database>,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Core error kind → HTTP status. Internal failures are logged here; the
/// core never swallows them.
fn err(e: Error) -> ApiError {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::Degraded(_) => StatusCode::CONFLICT,
        Error::Invalid(_) => StatusCode::BAD_REQUEST,
        Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "request failed");
    }
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The complete route table, shared by the binary and the integration
/// tests.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/libraries", post(create_library).get(list_libraries))
        .route(
            "/libraries/{id}",
            get(get_library).put(update_library).delete(delete_library),
        )
        .route("/libraries/{id}/index", post(build_index))
        .route("/libraries/{id}/stats", get(library_stats))
        .route(
            "/libraries/{id}/documents",
            post(create_document).get(list_documents),
        )
        .route(
            "/libraries/{id}/documents/{doc_id}",
            get(get_document).delete(delete_document),
        )
        .route("/libraries/{id}/documents/{doc_id}/chunks", post(append_chunks))
        .route(
            "/libraries/{id}/documents/{doc_id}/chunks/{chunk_id}",
            get(get_chunk).patch(update_chunk_metadata).delete(delete_chunk),
        )
        .route("/search/libraries", post(search_many))
        .route("/search/libraries/{id}", post(search_one))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "libraries": ctx.db.list_libraries().len(),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Libraries
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateLibraryRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    index_kind: Option<IndexKind>,
    #[serde(default)]
    lsh: Option<LshParams>,
}

async fn create_library(
    State(ctx): State<AppContext>,
    Json(body): Json<CreateLibraryRequest>,
) -> (StatusCode, Json<Library>) {
    let library = ctx.db.create_library(
        body.name,
        body.description,
        body.metadata,
        body.index_kind,
        body.lsh,
    );
    (StatusCode::CREATED, Json(library))
}

async fn list_libraries(State(ctx): State<AppContext>) -> Json<Vec<Library>> {
    Json(ctx.db.list_libraries())
}

async fn get_library(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Library>, ApiError> {
    ctx.db.get_library(id).map(Json).map_err(err)
}

#[derive(Deserialize)]
pub struct UpdateLibraryRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    index_kind: Option<IndexKind>,
    #[serde(default)]
    lsh: Option<LshParams>,
}

async fn update_library(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateLibraryRequest>,
) -> Result<Json<Library>, ApiError> {
    let update = LibraryUpdate {
        name: body.name,
        description: body.description,
        metadata: body.metadata,
        index_kind: body.index_kind,
        lsh: body.lsh,
    };
    ctx.db.update_library(id, update).map(Json).map_err(err)
}

async fn delete_library(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    ctx.db.delete_library(id).map(|_| StatusCode::NO_CONTENT).map_err(err)
}

// ---------------------------------------------------------------------------
// Index build + stats
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BuildIndexQuery {
    #[serde(default)]
    kind: Option<IndexKind>,
}

async fn build_index(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Query(query): Query<BuildIndexQuery>,
) -> Result<Json<IndexStats>, ApiError> {
    // Builds are CPU-heavy for large libraries — keep them off the
    // runtime threads. The unwrap only fires if the task panicked, and
    // panics are fatal by policy.
    let db = Arc::clone(&ctx.db);
    tokio::task::spawn_blocking(move || db.build_index(id, query.kind))
        .await
        .unwrap()
        .map(Json)
        .map_err(err)
}

async fn library_stats(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<LibraryStats>, ApiError> {
    ctx.db.library_stats(id).map(Json).map_err(err)
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    name: String,
    #[serde(default)]
    metadata: Metadata,
}

async fn create_document(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    ctx.db
        .create_document(id, body.name, body.metadata)
        .map(|doc| (StatusCode::CREATED, Json(doc)))
        .map_err(err)
}

async fn list_documents(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Document>>, ApiError> {
    ctx.db.list_documents(id).map(Json).map_err(err)
}

async fn get_document(
    State(ctx): State<AppContext>,
    Path((id, doc_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Document>, ApiError> {
    ctx.db.get_document(id, doc_id).map(Json).map_err(err)
}

async fn delete_document(
    State(ctx): State<AppContext>,
    Path((id, doc_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    ctx.db.delete_document(id, doc_id).map(|_| StatusCode::NO_CONTENT).map_err(err)
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ChunkRequest {
    text: String,
    embedding: Vec<f64>,
    #[serde(default)]
    metadata: Metadata,
}

async fn append_chunks(
    State(ctx): State<AppContext>,
    Path((id, doc_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<Vec<ChunkRequest>>,
) -> Result<(StatusCode, Json<Vec<Chunk>>), ApiError> {
    let inputs: Vec<ChunkInput> = body
        .into_iter()
        .map(|c| ChunkInput { text: c.text, embedding: c.embedding, metadata: c.metadata })
        .collect();
    ctx.db
        .add_chunks(id, doc_id, inputs)
        .map(|chunks| (StatusCode::CREATED, Json(chunks)))
        .map_err(err)
}

/// Chunk routes carry the document id; a chunk reached through the wrong
/// document is not found.
fn owned_by(chunk: Chunk, doc_id: Uuid) -> Result<Chunk, ApiError> {
    if chunk.document_id == doc_id {
        Ok(chunk)
    } else {
        Err(err(Error::NotFound(format!("chunk {} in document {doc_id}", chunk.id))))
    }
}

async fn get_chunk(
    State(ctx): State<AppContext>,
    Path((id, doc_id, chunk_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<Json<Chunk>, ApiError> {
    let chunk = ctx.db.get_chunk(id, chunk_id).map_err(err)?;
    owned_by(chunk, doc_id).map(Json)
}

#[derive(Deserialize)]
pub struct UpdateChunkRequest {
    metadata: Metadata,
}

async fn update_chunk_metadata(
    State(ctx): State<AppContext>,
    Path((id, doc_id, chunk_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(body): Json<UpdateChunkRequest>,
) -> Result<Json<Chunk>, ApiError> {
    let existing = ctx.db.get_chunk(id, chunk_id).map_err(err)?;
    owned_by(existing, doc_id)?;
    ctx.db.update_chunk_metadata(id, chunk_id, body.metadata).map(Json).map_err(err)
}

async fn delete_chunk(
    State(ctx): State<AppContext>,
    Path((id, doc_id, chunk_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let existing = ctx.db.get_chunk(id, chunk_id).map_err(err)?;
    owned_by(existing, doc_id)?;
    ctx.db.delete_chunk(id, chunk_id).map(|_| StatusCode::NO_CONTENT).map_err(err)
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SearchRequest {
    query_embedding: Vec<f64>,
    k: i64,
    /// Raw JSON so a malformed filter maps to 400, not a body rejection.
    #[serde(default)]
    filters: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct MultiSearchRequest {
    query_embedding: Vec<f64>,
    k: i64,
    library_ids: Vec<Uuid>,
    #[serde(default)]
    filters: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct SearchResultEntry {
    chunk: Chunk,
    distance: f64,
}

#[derive(Serialize)]
pub struct SearchResponse {
    results: Vec<SearchResultEntry>,
}

fn validate_k(k: i64) -> Result<usize, ApiError> {
    usize::try_from(k)
        .ok()
        .filter(|k| *k > 0)
        .ok_or_else(|| err(Error::invalid("k must be a positive integer")))
}

fn parse_filters(raw: Option<serde_json::Value>) -> Result<Option<Filter>, ApiError> {
    match raw {
        None => Ok(None),
        Some(value) => serde_json::from_value::<Filter>(value)
            .map(Some)
            .map_err(|e| err(Error::Invalid(format!("malformed filter: {e}")))),
    }
}

fn to_response(hits: Vec<SearchHit>) -> Json<SearchResponse> {
    Json(SearchResponse {
        results: hits
            .into_iter()
            .map(|h| SearchResultEntry { chunk: h.chunk, distance: h.distance })
            .collect(),
    })
}

async fn search_one(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let k = validate_k(body.k)?;
    let filter = parse_filters(body.filters)?;
    // A search may trigger an index rebuild — treat it like the build.
    let db = Arc::clone(&ctx.db);
    tokio::task::spawn_blocking(move || {
        db.search(id, &body.query_embedding, k, filter.as_ref())
    })
    .await
    .unwrap()
    .map(to_response)
    .map_err(err)
}

async fn search_many(
    State(ctx): State<AppContext>,
    Json(body): Json<MultiSearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let k = validate_k(body.k)?;
    let filter = parse_filters(body.filters)?;
    let db = Arc::clone(&ctx.db);
    tokio::task::spawn_blocking(move || {
        db.multi_search(&body.library_ids, &body.query_embedding, k, filter.as_ref())
    })
    .await
    .unwrap()
    .map(to_response)
    .map_err(err)
}
