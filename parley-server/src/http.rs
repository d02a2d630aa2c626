//! Parley HTTP REST API
//!
//! Axum-based HTTP server exposing chat, upload, indexing and prompt
//! management. Each endpoint has a thin axum handler that delegates to an
//! inner function returning `(StatusCode, serde_json::Value)`; the inner
//! functions are tested directly without axum dispatch.
//!
//! Endpoints:
//! - GET  /health                                - DB status
//! - GET  /version                               - server version info
//! - POST /api/bot/import_data                   - multipart upload (field `file`)
//! - POST /api/bot/process_unprocessed           - index pending uploads
//! - POST /api/bot/stream_chat                   - chunked plain-text answer
//! - POST /api/bot/chat                          - full answer in the envelope
//! - GET  /api/bot/custom_prompt                 - current instruction
//! - POST /api/bot/custom_prompt                 - store a new revision
//! - GET  /api/bot/custom_prompt/revisions       - recent revisions
//! - GET  /api/bot/conversations/:id/history     - recent turns
//! - GET  /api/bot/documents/:id                 - document metadata

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use parley_core::config::HttpConfig;
use parley_core::error::ParleyError;
use parley_core::store::{DocumentStore, HistoryStore, PromptStore};
use parley_core::ApiResponse;
use parley_ingest::extract::extension_of;
use parley_ingest::{Indexer, Uploader};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::subsystems::session::{AnswerStream, SessionManager};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    /// `None` when running without a database (tests).
    pub pool: Option<PgPool>,
    pub sessions: Arc<SessionManager>,
    pub uploader: Arc<Uploader>,
    pub indexer: Arc<Indexer>,
    pub documents: Arc<dyn DocumentStore>,
    pub history: Arc<dyn HistoryStore>,
    pub prompts: Arc<dyn PromptStore>,
    pub index_name: String,
    pub default_batch_size: usize,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    // Headroom over the file ceiling so oversized uploads reach the
    // uploader and get a validation error instead of a transport error.
    let body_limit = state.uploader.max_file_size().saturating_mul(2).max(1024 * 1024);

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/api/bot/import_data", post(import_data_handler))
        .route("/api/bot/process_unprocessed", post(process_unprocessed_handler))
        .route("/api/bot/stream_chat", post(stream_chat_handler))
        .route("/api/bot/chat", post(chat_handler))
        .route(
            "/api/bot/custom_prompt",
            get(get_prompt_handler).post(set_prompt_handler),
        )
        .route("/api/bot/custom_prompt/revisions", get(prompt_revisions_handler))
        .route("/api/bot/conversations/:id/history", get(history_handler))
        .route("/api/bot/documents/:id", get(document_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: &HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Parley HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ProcessRequest {
    pub index_name: Option<String>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub content: Option<String>,
    /// Accepted for clients that send the older field name.
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn resolved(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

// ============================================================================
// Error mapping
// ============================================================================

pub fn error_status(err: &ParleyError) -> StatusCode {
    match err {
        ParleyError::Validation(_) => StatusCode::BAD_REQUEST,
        ParleyError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        ParleyError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Envelope for a failed request. Full detail goes to the log only.
pub fn error_response(err: &ParleyError) -> (StatusCode, serde_json::Value) {
    if err.is_validation() {
        tracing::debug!(error = %err, "Rejected request");
    } else {
        tracing::error!(error = %err, "Request failed");
    }
    (error_status(err), ApiResponse::err(err.public_message()).into())
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    (StatusCode::BAD_REQUEST, ApiResponse::err(msg).into())
}

fn ok(data: serde_json::Value) -> (StatusCode, serde_json::Value) {
    (StatusCode::OK, ApiResponse::ok(data).into())
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Uploads still waiting for a batch run; `null` when the count fails.
async fn pending_documents(documents: &dyn DocumentStore) -> serde_json::Value {
    match documents.count_unprocessed().await {
        Ok(n) => serde_json::json!(n),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to count pending documents");
            serde_json::Value::Null
        }
    }
}

/// Inner health check - queries DB when one is configured.
pub async fn health_inner(
    pool: Option<&PgPool>,
    documents: &dyn DocumentStore,
    live_sessions: usize,
) -> (StatusCode, serde_json::Value) {
    let Some(pool) = pool else {
        return (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": "not configured",
                "sessions": live_sessions,
                "pending_documents": pending_documents(documents).await,
            }),
        );
    };

    let pg_ver = match parley_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": "database unavailable",
                }),
            );
        }
    };

    let pgvector_ver = match parley_core::db::check_pgvector(pool).await {
        Ok(v) => v,
        Err(e) => format!("unavailable: {}", e),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "postgresql": pg_ver,
            "pgvector": pgvector_ver,
            "sessions": live_sessions,
            "pending_documents": pending_documents(documents).await,
        }),
    )
}

/// Inner version - returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "parley/1",
    })
}

/// Inner upload - the declared type is the file name's extension.
pub async fn import_inner(
    uploader: &Uploader,
    file_name: &str,
    bytes: Vec<u8>,
) -> (StatusCode, serde_json::Value) {
    let extension = extension_of(file_name).unwrap_or("");
    match uploader.ingest(file_name, bytes, extension).await {
        Ok(doc) => ok(serde_json::json!({
            "id": doc.id,
            "file_name": doc.file_name,
            "is_processed": doc.is_processed,
        })),
        Err(e) => error_response(&e),
    }
}

/// Inner batch trigger - falls back to the configured index and batch size.
pub async fn process_inner(
    indexer: &Indexer,
    default_index: &str,
    default_batch_size: usize,
    req: ProcessRequest,
) -> (StatusCode, serde_json::Value) {
    let index_name = req
        .index_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_index.to_string());
    let batch_size = req.batch_size.unwrap_or(default_batch_size);

    match indexer.process_unprocessed(&index_name, batch_size).await {
        Ok(report) => ok(serde_json::json!({
            "index_name": index_name,
            "indexed_ids": report.indexed_ids,
            "failed": report.failed,
        })),
        Err(e) => error_response(&e),
    }
}

fn chat_fields(req: ChatRequest) -> Result<(String, String), (StatusCode, serde_json::Value)> {
    let conversation_id = req
        .conversation_id
        .ok_or_else(|| bad_request("conversation_id field is required"))?;
    let message = req
        .message
        .ok_or_else(|| bad_request("message field is required"))?;
    Ok((conversation_id, message))
}

/// Inner streaming chat. The first fragment is awaited here so a failure
/// before any output becomes a JSON error instead of an empty stream.
pub async fn stream_chat_inner(
    sessions: &SessionManager,
    req: ChatRequest,
) -> std::result::Result<AnswerStream, (StatusCode, serde_json::Value)> {
    let (conversation_id, message) = chat_fields(req)?;
    let mut stream = sessions
        .respond(&conversation_id, &message)
        .await
        .map_err(|e| error_response(&e))?;

    match stream.next().await {
        Some(Ok(first)) => Ok(Box::pin(
            futures::stream::once(async move { Ok::<_, ParleyError>(first) }).chain(stream),
        )),
        Some(Err(e)) => Err(error_response(&e)),
        None => Ok(Box::pin(futures::stream::empty::<parley_core::error::Result<String>>())),
    }
}

/// Inner non-streaming chat.
pub async fn chat_inner(
    sessions: &SessionManager,
    req: ChatRequest,
) -> (StatusCode, serde_json::Value) {
    let (conversation_id, message) = match chat_fields(req) {
        Ok(fields) => fields,
        Err(resp) => return resp,
    };

    match sessions.collect(&conversation_id, &message).await {
        Ok(answer) => ok(serde_json::json!({
            "conversation_id": conversation_id.trim(),
            "answer": answer,
        })),
        Err(e) => error_response(&e),
    }
}

pub async fn get_prompt_inner(
    prompts: &dyn PromptStore,
    default_instruction: &str,
) -> (StatusCode, serde_json::Value) {
    match prompts.latest().await {
        Ok(Some(rev)) if !rev.content.trim().is_empty() => ok(serde_json::json!({
            "id": rev.id,
            "content": rev.content,
            "created_at": rev.created_at,
            "is_default": false,
        })),
        Ok(_) => ok(serde_json::json!({
            "id": null,
            "content": default_instruction,
            "created_at": null,
            "is_default": true,
        })),
        Err(e) => error_response(&e),
    }
}

pub async fn set_prompt_inner(
    prompts: &dyn PromptStore,
    req: PromptRequest,
) -> (StatusCode, serde_json::Value) {
    let Some(content) = req.content.or(req.prompt) else {
        return bad_request("content field is required");
    };

    match prompts.append(&content).await {
        Ok(rev) => {
            tracing::info!(revision = %rev.id, chars = rev.content.len(), "Stored prompt revision");
            ok(serde_json::json!({
                "id": rev.id,
                "content": rev.content,
                "created_at": rev.created_at,
            }))
        }
        Err(e) => error_response(&e),
    }
}

pub async fn prompt_revisions_inner(
    prompts: &dyn PromptStore,
    query: LimitQuery,
) -> (StatusCode, serde_json::Value) {
    match prompts.revisions(query.resolved()).await {
        Ok(revisions) => ok(serde_json::json!({ "revisions": revisions })),
        Err(e) => error_response(&e),
    }
}

pub async fn history_inner(
    history: &dyn HistoryStore,
    conversation_id: &str,
    query: LimitQuery,
) -> (StatusCode, serde_json::Value) {
    let conversation_id = conversation_id.trim();
    if conversation_id.is_empty() {
        return bad_request("conversation_id must not be empty");
    }

    match history.load_window(conversation_id, query.resolved()).await {
        Ok(turns) => ok(serde_json::json!({
            "conversation_id": conversation_id,
            "turns": turns,
        })),
        Err(e) => error_response(&e),
    }
}

pub async fn document_inner(
    documents: &dyn DocumentStore,
    id: &str,
) -> (StatusCode, serde_json::Value) {
    let Ok(id) = Uuid::parse_str(id) else {
        return bad_request(format!("'{}' is not a document id", id));
    };

    match documents.get(id).await {
        Ok(Some(doc)) => ok(serde_json::json!({
            "id": doc.id,
            "file_name": doc.file_name,
            "is_processed": doc.is_processed,
            "created_at": doc.created_at,
            "chars": doc.raw_text.chars().count(),
        })),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            ApiResponse::err(format!("document {} not found", id)).into(),
        ),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin - delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(
        state.pool.as_ref(),
        state.documents.as_ref(),
        state.sessions.session_count(),
    )
    .await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn import_data_handler(
    State(state): State<Arc<HttpState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let (status, body) = match read_file_field(&mut multipart).await {
        Ok(Some((file_name, bytes))) => import_inner(&state.uploader, &file_name, bytes).await,
        Ok(None) => bad_request("file field is required"),
        Err(e) => bad_request(format!("invalid upload: {}", e)),
    };
    (status, Json(body))
}

pub async fn process_unprocessed_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> impl IntoResponse {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        ProcessRequest::default()
    } else {
        match serde_json::from_slice::<ProcessRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                let (status, body) = bad_request(format!("invalid request body: {}", e));
                return (status, Json(body));
            }
        }
    };
    let (status, body) = process_inner(
        &state.indexer,
        &state.index_name,
        state.default_batch_size,
        req,
    )
    .await;
    (status, Json(body))
}

pub async fn stream_chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> Response {
    match stream_chat_inner(&state.sessions, req).await {
        Ok(stream) => {
            let body = Body::from_stream(stream.map(|fragment| {
                fragment
                    .map(Bytes::from)
                    .map_err(|e| std::io::Error::other(e.public_message()))
            }));
            (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                body,
            )
                .into_response()
        }
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let (status, body) = chat_inner(&state.sessions, req).await;
    (status, Json(body))
}

pub async fn get_prompt_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) =
        get_prompt_inner(state.prompts.as_ref(), state.sessions.default_instruction()).await;
    (status, Json(body))
}

pub async fn set_prompt_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<PromptRequest>,
) -> impl IntoResponse {
    let (status, body) = set_prompt_inner(state.prompts.as_ref(), req).await;
    (status, Json(body))
}

pub async fn prompt_revisions_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let (status, body) = prompt_revisions_inner(state.prompts.as_ref(), query).await;
    (status, Json(body))
}

pub async fn history_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let (status, body) = history_inner(state.history.as_ref(), &id, query).await;
    (status, Json(body))
}

pub async fn document_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = document_inner(state.documents.as_ref(), &id).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

/// File name and bytes of the `file` field, if present.
async fn read_file_field(
    multipart: &mut Multipart,
) -> std::result::Result<Option<(String, Vec<u8>)>, axum::extract::multipart::MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await?;
        return Ok(Some((file_name, bytes.to_vec())));
    }
    Ok(None)
}

// ============================================================================
// Unit Tests - call inner functions directly
// ============================================================================
