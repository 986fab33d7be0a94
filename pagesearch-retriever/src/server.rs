//! JSON HTTP surface served by `pagesearch serve`.
//!
//! | Method | Path                               | Body / query            |
//! |--------|------------------------------------|-------------------------|
//! | POST   | `/api/search/semantic`             | [`SearchRequest`]       |
//! | POST   | `/api/search/hybrid`               | [`SearchRequest`]       |
//! | POST   | `/api/search/keyword`              | [`SearchRequest`]       |
//! | PUT    | `/api/documents/{id}`              | [`DocumentInput`]       |
//! | POST   | `/api/documents/{id}/index`        |                         |
//! | GET    | `/api/jobs/{id}`                   |                         |
//! | GET    | `/api/admin/embeddings`            | `?status=pending`       |
//! | POST   | `/api/admin/embeddings/reindex`    | `{"filter": "failed"}`  |
//! | GET    | `/api/status`                      |                         |
//! | GET    | `/health`                          |                         |
//!
//! Errors come back as `{"error": "..."}`.

use crate::retrieval::indexer::IndexError;
use crate::retrieval::indexing_engine::{
    IndexingEngine, PendingFilter, PutReport, ReindexFilter, ReindexReport,
};
use crate::retrieval::task_queue::{JobId, JobRecord};
use crate::search::{
    HybridResults, KeywordHit, SearchEngine, SearchError, SearchRequest, SemanticResults,
};
use crate::status::{StatusApi, SystemStatus};
use crate::storage::{DocumentId, DocumentInput, DocumentSummary, SqliteStore};
use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use pagesearch_embed::HttpEmbeddingClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub engine: Arc<IndexingEngine>,
    pub search: Arc<SearchEngine>,
    pub embed_client: Arc<HttpEmbeddingClient>,
}

/// An error rendered as a status code and `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        let status = match &err {
            SearchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SearchError::NotAccessible(_) => StatusCode::FORBIDDEN,
            SearchError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SearchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        let status = match &err {
            IndexError::NotFound(_) => StatusCode::NOT_FOUND,
            IndexError::Embedding(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/search/semantic", post(semantic_search))
        .route("/api/search/hybrid", post(hybrid_search))
        .route("/api/search/keyword", post(keyword_search))
        .route("/api/documents/{id}", put(put_document))
        .route("/api/documents/{id}/index", post(index_document))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/admin/embeddings", get(pending_embeddings))
        .route("/api/admin/embeddings/reindex", post(reindex))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop the indexing workers.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let engine = state.engine.clone();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("pagesearch listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    engine.shutdown().await;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> ApiResult<SystemStatus> {
    let engine = state.engine.as_ref();
    let status = StatusApi::get_system_status(&state.store, Some(engine), &state.embed_client).await?;
    Ok(Json(status))
}

async fn semantic_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<SemanticResults> {
    Ok(Json(state.search.semantic_search(&request).await?))
}

async fn hybrid_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<HybridResults> {
    Ok(Json(state.search.hybrid_search(&request).await?))
}

async fn keyword_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Vec<KeywordHit>> {
    Ok(Json(state.search.keyword_search(&request).await?))
}

async fn put_document(
    State(state): State<AppState>,
    Path(id): Path<DocumentId>,
    Json(input): Json<DocumentInput>,
) -> ApiResult<PutReport> {
    if input.title.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "title required"));
    }
    let report = state.engine.put_document(input.with_id(id)).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct JobAccepted {
    job_id: JobId,
}

async fn index_document(
    State(state): State<AppState>,
    Path(id): Path<DocumentId>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let job_id = state.engine.regenerate(id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

async fn job_status(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<JobRecord> {
    state
        .engine
        .job_status(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("job {id} not found")))
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    #[serde(default)]
    status: PendingFilter,
}

async fn pending_embeddings(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Vec<DocumentSummary>> {
    Ok(Json(state.engine.list_documents_by_status(query.status).await?))
}

#[derive(Debug, Deserialize)]
struct ReindexBody {
    #[serde(default = "default_reindex_filter")]
    filter: ReindexFilter,
}

fn default_reindex_filter() -> ReindexFilter {
    ReindexFilter::All
}

async fn reindex(
    State(state): State<AppState>,
    Json(body): Json<ReindexBody>,
) -> Result<(StatusCode, Json<ReindexReport>), ApiError> {
    let report = state.engine.reindex_all(body.filter).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}
