//! HTTP surface for the question-answering pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/run` | Answer questions about one document |
//! | `POST` | `/hackrx/run` | Same as `/run`, for existing clients |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/cache/stats` | Index cache counters |
//! | `DELETE` | `/cache/clear` | Drop every cached index |
//!
//! # Request
//!
//! ```json
//! {
//!   "documents": "https://example.com/policy.pdf",
//!   "questions": ["Is hospitalization covered?", "What is the waiting period?"],
//!   "top_k": 5,
//!   "max_context_chars": 6000
//! }
//! ```
//!
//! `documents` is fetched when it is an `http(s)` URL and used as inline
//! text otherwise. Local paths are never read on behalf of HTTP clients.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "empty_document", "message": "document contains no extractable text" } }
//! ```
//!
//! | Status | Codes |
//! |--------|-------|
//! | 400 | `bad_request`, `fetch`, `empty_document`, `invalid_argument` |
//! | 401 | `unauthorized` (when `[server].auth_token` is set) |
//! | 404 | `not_found` (cache endpoints with caching disabled) |
//! | 408 | `timeout`, `cancelled` |
//! | 500 | any other pipeline error kind |
//!
//! Per-question failures are not HTTP errors; they appear as error-marked
//! answers inside a 200 response.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::CacheStats;
use crate::config::Config;
use crate::error::{ErrorKind, QaError};
use crate::models::{DocumentSource, RunReport};
use crate::pipeline::PipelineCoordinator;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    coordinator: Arc<PipelineCoordinator>,
    /// Expected bearer token, if authentication is enabled.
    auth_token: Option<Arc<str>>,
}

/// Build the coordinator from `config` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let coordinator = Arc::new(PipelineCoordinator::from_config(config)?);
    run_server_with(config, coordinator).await
}

/// Serve an already-built coordinator on `[server].bind`.
///
/// Used by tests and by binaries that plug in their own fetcher, embedder,
/// or completion backend.
pub async fn run_server_with(
    config: &Config,
    coordinator: Arc<PipelineCoordinator>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(coordinator, config.server.auth_token.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(
        addr = %bind_addr,
        auth = config.server.auth_token.is_some(),
        "policy QA server listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(coordinator: Arc<PipelineCoordinator>, auth_token: Option<String>) -> Router {
    let state = AppState {
        coordinator,
        auth_token: auth_token.map(Arc::from),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/run", post(handle_run))
        .route("/hackrx/run", post(handle_run))
        .route("/health", get(handle_health))
        .route("/cache/stats", get(handle_cache_stats))
        .route("/cache/clear", delete(handle_cache_clear))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"timeout"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

impl From<QaError> for AppError {
    fn from(err: QaError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Fetch | ErrorKind::EmptyDocument | ErrorKind::InvalidArgument => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::Timeout | ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: kind.as_str().to_string(),
            message: err.to_string(),
        }
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(unauthorized("invalid bearer token")),
        None => Err(unauthorized("missing bearer token")),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /run ============

#[derive(Debug, Deserialize)]
struct RunRequest {
    documents: String,
    questions: Vec<String>,
    #[serde(default)]
    top_k: Option<i64>,
    #[serde(default)]
    max_context_chars: Option<usize>,
}

#[derive(Serialize)]
struct RunResponse {
    /// Answer text per question, in request order.
    answers: Vec<String>,
    processing_time: f64,
    /// Texts of the passages retrieved for each question.
    source_chunks: Vec<Vec<String>>,
    report: RunReport,
}

async fn handle_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, AppError> {
    authorize(&state, &headers)?;

    let documents = req.documents.trim();
    if documents.is_empty() {
        return Err(bad_request("documents must not be empty"));
    }
    if req.questions.is_empty() {
        return Err(bad_request("questions must not be empty"));
    }
    if req.questions.iter().any(|q| q.trim().is_empty()) {
        return Err(bad_request("questions must not contain empty strings"));
    }

    let source = match DocumentSource::parse(documents) {
        url @ DocumentSource::Url(_) => url,
        _ => DocumentSource::Text(req.documents.clone()),
    };

    let mut options = state.coordinator.default_options();
    if let Some(k) = req.top_k {
        options.k = k;
    }
    if let Some(max) = req.max_context_chars {
        options.max_context_chars = max;
    }

    let report = state
        .coordinator
        .run(&source, &req.questions, options)
        .await?;

    Ok(Json(RunResponse {
        answers: report.answers.iter().map(|a| a.text.clone()).collect(),
        processing_time: report.processing_time,
        source_chunks: report
            .retrieved_passages
            .iter()
            .map(|hits| hits.iter().map(|h| h.text.clone()).collect())
            .collect(),
        report,
    }))
}

// ============ /cache ============

async fn handle_cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CacheStats>, AppError> {
    authorize(&state, &headers)?;
    let cache = state
        .coordinator
        .cache()
        .ok_or_else(|| not_found("index cache is disabled"))?;
    Ok(Json(cache.stats().await))
}

#[derive(Serialize)]
struct ClearResponse {
    cleared: usize,
}

async fn handle_cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearResponse>, AppError> {
    authorize(&state, &headers)?;
    let cache = state
        .coordinator
        .cache()
        .ok_or_else(|| not_found("index cache is disabled"))?;
    Ok(Json(ClearResponse {
        cleared: cache.clear().await,
    }))
}
