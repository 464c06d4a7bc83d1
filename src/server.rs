//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version and models) |
//! | `POST`   | `/v1/text/split` | Chunk text, optionally storing the chunks |
//! | `GET`    | `/v1/documents` | Chunk statistics for every document, newest first |
//! | `GET`    | `/v1/documents/{id}/chunks` | Page through a document's chunks (`limit`, `offset`) |
//! | `GET`    | `/v1/documents/{id}/chunks/{chunk_id}` | One chunk |
//! | `GET`    | `/v1/documents/{id}/stats` | Chunk statistics |
//! | `DELETE` | `/v1/documents/{id}` | Delete a document's chunks and index |
//! | `POST`   | `/v1/vector/index` | Build an index from supplied vectors or stored chunks |
//! | `POST`   | `/v1/vector/search` | Search one document's index |
//! | `POST`   | `/v1/vector/global-search` | Search every index |
//! | `GET`    | `/v1/vector/indexes` | Index summaries, newest first |
//! | `GET`    | `/v1/vector/indexes/{id}` | One index summary |
//! | `DELETE` | `/v1/vector/indexes/{id}` | Delete an index |
//! | `POST`   | `/v1/ingest` | Split, store, embed, and index text |
//! | `POST`   | `/v1/retrieve` | Ranked contexts for a question |
//! | `POST`   | `/v1/answer` | Retrieval-augmented answer |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "dimension_mismatch", "message": "...", "step": null } }
//! ```
//!
//! | Error | Status | Code |
//! |-------|--------|------|
//! | `Input` | 400 | the input kind, e.g. `empty_input` |
//! | `NotFound` | 404 | `not_found` |
//! | `UpstreamUnavailable` | 502 | `upstream_unavailable` |
//! | `Processing(cancelled)` | 408 | `timeout` |
//! | `Processing` | 500 | `processing_error` (with `step`) |
//! | `Io` / `Serialization` | 500 | `internal` |
//!
//! Collaborator outages reach the vector and ingest endpoints as
//! `UpstreamUnavailable` (502). `/v1/retrieve` and `/v1/answer` tag them with
//! the failing step instead, so they surface as 500 `processing_error` with
//! `step` set to `embedding_generation` or `answer_generation`.
//!
//! Global searches, retrievals, and answers run on a spawned task bounded by
//! `server.request_timeout_secs`; a dropped connection stops the fan-out.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use docrag_core::chunk::{split_text, ChunkerConfig};
use docrag_core::embedding::EmbeddingRequest;
use docrag_core::error::{InputKind, RetrievalError, Step};
use docrag_core::index::IndexConfig;
use docrag_core::models::{validate_document_id, Chunk, ChunkStatistics};
use docrag_core::pipeline::{AnswerRequest, MAX_CONTEXT_LENGTH};

use crate::ingest;
use crate::services::{self, run_cancellable, Services};

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(services: Services) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "docrag server listening");
    axum::serve(listener, router(services)).await?;
    Ok(())
}

/// The full route table, for embedding in another server or for tests.
pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/text/split", post(handle_split))
        .route("/v1/documents", get(handle_documents))
        .route(
            "/v1/documents/{id}",
            axum::routing::delete(handle_delete_document),
        )
        .route("/v1/documents/{id}/chunks", get(handle_chunks))
        .route("/v1/documents/{id}/chunks/{chunk_id}", get(handle_chunk))
        .route("/v1/documents/{id}/stats", get(handle_document_stats))
        .route("/v1/vector/index", post(handle_build_index))
        .route("/v1/vector/search", post(handle_search))
        .route("/v1/vector/global-search", post(handle_global_search))
        .route("/v1/vector/indexes", get(handle_list_indexes))
        .route(
            "/v1/vector/indexes/{id}",
            get(handle_index_stats).delete(handle_delete_index),
        )
        .route("/v1/ingest", post(handle_ingest))
        .route("/v1/retrieve", post(handle_retrieve))
        .route("/v1/answer", post(handle_answer))
        .layer(cors)
        .with_state(services)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    step: Option<Step>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    step: Option<Step>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                step: self.step,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RetrievalError> for AppError {
    fn from(e: RetrievalError) -> Self {
        let message = e.to_string();
        let (status, code, step) = match &e {
            RetrievalError::Input { kind, .. } => (StatusCode::BAD_REQUEST, kind.as_str(), None),
            RetrievalError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            RetrievalError::UpstreamUnavailable { .. } => {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable", None)
            }
            RetrievalError::Processing {
                step: Step::Cancelled,
                ..
            } => (StatusCode::REQUEST_TIMEOUT, "timeout", Some(Step::Cancelled)),
            RetrievalError::Processing { step, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "processing_error",
                Some(*step),
            ),
            RetrievalError::Io(_) | RetrievalError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message,
            step,
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    RetrievalError::input(InputKind::InvalidRequest, message).into()
}

fn not_found(message: impl Into<String>) -> AppError {
    RetrievalError::not_found(message).into()
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============ Health ============

async fn handle_health(State(services): State<Services>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "embedding_model": services.embedder.model_name(),
        "generation_model": services.generator.model_name(),
    }))
}

// ============ Documents ============

#[derive(Deserialize)]
struct SplitRequest {
    #[serde(default)]
    document_id: Option<String>,
    text: String,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    chunk_overlap: Option<usize>,
    #[serde(default)]
    min_chunk_size: Option<usize>,
    #[serde(default)]
    separators: Option<Vec<String>>,
    #[serde(default = "default_true")]
    store: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct SplitResponse {
    document_id: String,
    chunks: Vec<Chunk>,
    statistics: ChunkStatistics,
    stored: bool,
}

async fn handle_split(
    State(services): State<Services>,
    Json(req): Json<SplitRequest>,
) -> ApiResult<SplitResponse> {
    let document_id = req
        .document_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let base = &services.config.chunking;
    let config = ChunkerConfig {
        chunk_size: req.chunk_size.unwrap_or(base.chunk_size),
        chunk_overlap: req.chunk_overlap.unwrap_or(base.chunk_overlap),
        min_chunk_size: req.min_chunk_size.unwrap_or(base.min_chunk_size),
        separators: req.separators.unwrap_or_else(|| base.separators.clone()),
        ..base.clone()
    };

    validate_document_id(&document_id)?;
    let chunks = split_text(&document_id, &req.text, &config)?;
    let statistics = if req.store {
        services.chunks.save(&document_id, &chunks).await?
    } else {
        ChunkStatistics::from_chunks(&document_id, &chunks)
    };

    Ok(Json(SplitResponse {
        document_id,
        chunks,
        statistics,
        stored: req.store,
    }))
}

async fn handle_documents(State(services): State<Services>) -> ApiResult<Vec<ChunkStatistics>> {
    Ok(Json(services.chunks.documents().await?))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

#[derive(Serialize)]
struct ChunksResponse {
    document_id: String,
    offset: usize,
    chunks: Vec<Chunk>,
}

async fn handle_chunks(
    State(services): State<Services>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<ChunksResponse> {
    let chunks = services.chunks.list(&id, page.limit, page.offset).await?;
    Ok(Json(ChunksResponse {
        document_id: id,
        offset: page.offset,
        chunks,
    }))
}

async fn handle_chunk(
    State(services): State<Services>,
    Path((id, chunk_id)): Path<(String, String)>,
) -> ApiResult<Chunk> {
    match services.chunks.get(&id, &chunk_id).await? {
        Some(chunk) => Ok(Json(chunk)),
        None => Err(not_found(format!("chunk {} not found in {}", chunk_id, id))),
    }
}

async fn handle_document_stats(
    State(services): State<Services>,
    Path(id): Path<String>,
) -> ApiResult<ChunkStatistics> {
    match services.chunks.statistics(&id).await? {
        Some(stats) => Ok(Json(stats)),
        None => Err(not_found(format!("no chunks for {}", id))),
    }
}

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    chunks_deleted: bool,
    index_deleted: bool,
}

async fn handle_delete_document(
    State(services): State<Services>,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    let index_deleted = services.registry.delete(&id).await?;
    let chunks_deleted = services.chunks.delete(&id).await?;
    if !index_deleted && !chunks_deleted {
        return Err(not_found(format!("document {} not found", id)));
    }
    Ok(Json(DeleteResponse {
        document_id: id,
        chunks_deleted,
        index_deleted,
    }))
}

// ============ Vector index ============

#[derive(Deserialize)]
struct BuildIndexRequest {
    document_id: String,
    /// When absent, the document's stored chunks are embedded.
    #[serde(default)]
    vectors: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    embedding_ids: Option<Vec<String>>,
    #[serde(default)]
    chunk_ids: Option<Vec<String>>,
    #[serde(default)]
    model_identifier: Option<String>,
    #[serde(default)]
    config: Option<IndexConfig>,
}

async fn handle_build_index(
    State(services): State<Services>,
    Json(req): Json<BuildIndexRequest>,
) -> ApiResult<docrag_core::models::IndexSummary> {
    let summary = match req.vectors {
        None => ingest::index_document(&services, &req.document_id).await?,
        Some(vectors) => {
            let chunk_ids = req
                .chunk_ids
                .ok_or_else(|| bad_request("chunk_ids are required with vectors"))?;
            let embedding_ids = req.embedding_ids.unwrap_or_else(|| {
                (0..vectors.len())
                    .map(|_| uuid::Uuid::new_v4().to_string())
                    .collect()
            });
            let config = req.config.unwrap_or_else(|| services.config.index.clone());
            services
                .indexes
                .build(
                    &req.document_id,
                    vectors,
                    embedding_ids,
                    chunk_ids,
                    &config,
                    req.model_identifier,
                )
                .await?
        }
    };
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct SearchRequest {
    #[serde(default)]
    document_id: Option<String>,
    /// Text to embed as the query.
    #[serde(default)]
    query: Option<String>,
    /// Pre-computed query vector.
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    similarity_threshold: f32,
}

fn default_top_k() -> usize {
    5
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<docrag_core::models::SearchHit>,
    total: usize,
}

async fn query_vector(services: &Services, req: &SearchRequest) -> Result<Vec<f32>, AppError> {
    if !(1..=MAX_CONTEXT_LENGTH).contains(&req.top_k) {
        return Err(bad_request(format!(
            "top_k must be between 1 and {}",
            MAX_CONTEXT_LENGTH
        )));
    }
    if let Some(vector) = &req.vector {
        return Ok(vector.clone());
    }
    let text = match req.query.as_deref() {
        Some(q) if !q.trim().is_empty() => q,
        _ => return Err(bad_request("either query or vector is required")),
    };
    let response = services
        .embedder
        .embed(&EmbeddingRequest {
            texts: vec![text.to_string()],
            model: None,
            normalize: services.config.retrieval.normalize_queries,
        })
        .await?;
    response.vectors.into_iter().next().ok_or_else(|| {
        RetrievalError::processing(Step::EmbeddingGeneration, "provider returned no embedding")
            .into()
    })
}

async fn handle_search(
    State(services): State<Services>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    let document_id = req
        .document_id
        .clone()
        .ok_or_else(|| bad_request("document_id is required"))?;
    let query = query_vector(&services, &req).await?;
    let results = services
        .indexes
        .search(&document_id, &query, req.top_k, req.similarity_threshold)
        .await?;
    Ok(Json(SearchResponse {
        total: results.len(),
        results,
    }))
}

async fn handle_global_search(
    State(services): State<Services>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    let query = query_vector(&services, &req).await?;
    let results =
        services::global_search(&services, query, req.top_k, req.similarity_threshold).await?;
    Ok(Json(SearchResponse {
        total: results.len(),
        results,
    }))
}

async fn handle_list_indexes(
    State(services): State<Services>,
) -> ApiResult<Vec<docrag_core::models::IndexSummary>> {
    Ok(Json(services.registry.list().await?))
}

async fn handle_index_stats(
    State(services): State<Services>,
    Path(id): Path<String>,
) -> ApiResult<docrag_core::models::IndexSummary> {
    match services.indexes.statistics(&id).await? {
        Some(summary) => Ok(Json(summary)),
        None => Err(not_found(format!("no index for {}", id))),
    }
}

async fn handle_delete_index(
    State(services): State<Services>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if services.registry.delete(&id).await? {
        Ok(Json(serde_json::json!({ "document_id": id, "deleted": true })))
    } else {
        Err(not_found(format!("no index for {}", id)))
    }
}

// ============ Ingest & retrieval ============

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    document_id: Option<String>,
    text: String,
}

async fn handle_ingest(
    State(services): State<Services>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<ingest::IngestReport> {
    let document_id = req
        .document_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Ok(Json(
        ingest::ingest_text(&services, &document_id, &req.text).await?,
    ))
}

async fn handle_retrieve(
    State(services): State<Services>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<docrag_core::pipeline::RetrievalOutcome> {
    let pipeline = services.pipeline.clone();
    let outcome = run_cancellable(
        services.request_timeout(),
        Step::VectorSearch,
        move |flag| async move { pipeline.retrieve(&req, Some(flag.as_ref())).await },
    )
    .await?;
    Ok(Json(outcome))
}

async fn handle_answer(
    State(services): State<Services>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<docrag_core::pipeline::AnswerResponse> {
    let pipeline = services.pipeline.clone();
    let response = run_cancellable(
        services.request_timeout(),
        Step::AnswerGeneration,
        move |flag| async move { pipeline.answer(&req, Some(flag.as_ref())).await },
    )
    .await?;
    Ok(Json(response))
}
