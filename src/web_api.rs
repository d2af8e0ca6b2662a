//! Web API Server
//!
//! HTTP front end over [`AdmissionService`]: submit chat jobs, poll their
//! status, and ask which modes are currently served.
//!
//! ## Endpoints
//!
//! - `POST /chat?mode=auto|gpu|api` — Submit a job (mode defaults to `auto`)
//! - `POST /chat/auto`, `/chat/gpu`, `/chat/api` — Submit with a fixed mode
//! - `GET  /chat/status/{job_id}` — Poll a job
//! - `GET  /chat/info`, `GET /modes` — Available modes and the current default
//! - `GET  /` — Service banner
//! - `GET  /health` — Liveness
//! - `GET  /metrics` — Prometheus metrics
//!
//! ## Status codes
//!
//! | Code | When |
//! |------|------|
//! | 200 | Job admitted or deduplicated |
//! | 409 | `gpu` forced while the GPU backend is unavailable |
//! | 413 | Body larger than `max_request_size` |
//! | 422 | Malformed body or out-of-range field |
//! | 404 | Unknown job id |
//! | 503 | Status store or work queue unreachable |

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionService, SubmitOutcome};
use crate::config::ServerSection;
use crate::job::{BackendKind, JobResult, JobStatus, Mode, SubmitRequest};
use crate::metrics;
use crate::DispatchError;

// ============================================================================
// Types & Configuration
// ============================================================================

/// Configuration for the web API HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address or hostname to bind to (e.g. `"0.0.0.0"` for all interfaces).
    pub host: String,
    /// TCP port the server listens on.
    pub port: u16,
    /// Maximum allowed request body size in bytes.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSection::default())
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
            max_request_size: section.max_request_size,
        }
    }
}

/// `?mode=` on `POST /chat`.
#[derive(Debug, Default, Deserialize)]
pub struct ModeQuery {
    /// `auto`, `gpu` or `api`.
    #[serde(default)]
    pub mode: Option<String>,
}

/// Body returned when a job is admitted or deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResponse {
    /// Job to poll.
    pub job_id: String,
    /// Status at admission time.
    pub status: JobStatus,
    /// Key that deduplicates resubmissions.
    pub idempotency_key: String,
    /// Failure description when a deduplicated job has already failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `GET /chat/status/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    /// Job id.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Backend that ran the job, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_used: Option<BackendKind>,
    /// Present when `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Present when `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct AppState {
    admission: AdmissionService,
}

// ============================================================================
// Server
// ============================================================================

/// Build the application router.
///
/// Exposed separately from [`start_server`] so callers can serve it on their
/// own listener.
pub fn router(admission: AdmissionService, max_request_size: usize) -> Router {
    let state = Arc::new(AppState { admission });

    Router::new()
        .route("/", get(banner_handler))
        .route("/chat", post(chat_handler))
        .route("/chat/auto", post(chat_auto_handler))
        .route("/chat/gpu", post(chat_gpu_handler))
        .route("/chat/api", post(chat_api_handler))
        .route("/chat/status/:job_id", get(status_handler))
        .route("/chat/info", get(info_handler))
        .route("/modes", get(info_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(RequestBodyLimitLayer::new(max_request_size))
        .layer(middleware::from_fn_with_state(
            max_request_size,
            body_size_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web API server. Runs until the server fails.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    config: ServerConfig,
    admission: AdmissionService,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_shutdown(config, admission, std::future::pending()).await
}

/// Start the web API server and stop accepting connections once `shutdown`
/// resolves. In-flight requests are allowed to finish.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server_with_shutdown<F>(
    config: ServerConfig,
    admission: AdmissionService,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let app = router(admission, config.max_request_size);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Web API ready on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Web API stopped");
    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Echo the client's `X-Request-ID`, or a fresh UUID v4, on every response.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
/// Bodies without a length are capped by `RequestBodyLimitLayer`.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());

    if declared.is_some_and(|len| len > max_size) {
        return AppError::PayloadTooLarge.into_response();
    }

    next.run(req).await
}

// ============================================================================
// Chat Handlers
// ============================================================================

/// `POST /chat?mode=` — Submit with the mode from the query string.
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModeQuery>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let mode = match query.mode.as_deref() {
        None => Mode::default(),
        Some(raw) => raw.parse::<Mode>()?,
    };
    submit(&state, mode, body).await
}

async fn chat_auto_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    submit(&state, Mode::Auto, body).await
}

async fn chat_gpu_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    submit(&state, Mode::Gpu, body).await
}

async fn chat_api_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    submit(&state, Mode::Api, body).await
}

async fn submit(
    state: &AppState,
    mode: Mode,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(AppError::from)?;
    let outcome = state.admission.submit(request, mode).await?;
    Ok(submit_response(outcome))
}

fn submit_response(outcome: SubmitOutcome) -> Response {
    // A same-key retry of a rejected job answers like the first call.
    match outcome.rejection {
        Some(rejection) => (
            StatusCode::CONFLICT,
            Json(json!({
                "job_id": outcome.job_id.to_string(),
                "status": outcome.status,
                "idempotency_key": outcome.idempotency_key,
                "error_code": rejection.code(),
                "error": outcome.error.unwrap_or_else(|| rejection.to_string()),
            })),
        )
            .into_response(),
        None => Json(SubmitResponse {
            job_id: outcome.job_id.to_string(),
            status: outcome.status,
            idempotency_key: outcome.idempotency_key,
            error: outcome.error,
        })
        .into_response(),
    }
}

/// `GET /chat/status/{job_id}` — Poll a job.
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let record = state.admission.status(&job_id).await?;
    Ok(Json(StatusResponse {
        job_id: record.job_id.to_string(),
        status: record.status,
        created_at: record.created_at,
        mode_used: record.mode_used,
        result: record.result,
        error: record.error,
    }))
}

/// `GET /chat/info` and `GET /modes`.
async fn info_handler(State(state): State<Arc<AppState>>) -> Json<crate::admission::ModeInfo> {
    Json(state.admission.info().await)
}

// ============================================================================
// Utility Handlers
// ============================================================================

async fn banner_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "submit": "POST /chat?mode=auto|gpu|api",
            "status": "GET /chat/status/{job_id}",
            "info": "GET /chat/info",
        },
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /metrics` — Prometheus text format, with queue depths sampled at
/// scrape time.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    for kind in [BackendKind::Gpu, BackendKind::Api] {
        match state.admission.queue_depth(kind).await {
            Ok(depth) => metrics::set_queue_depth(state.admission.queues().for_backend(kind), depth),
            Err(e) => warn!(backend = %kind, error = %e, "queue depth unavailable"),
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
        .into_response()
}

// ============================================================================
// Error Type
// ============================================================================

/// Application-level errors returned by API handlers.
///
/// Each variant maps to an HTTP status code and a JSON error body with a
/// stable `error_code`.
#[derive(Debug)]
pub enum AppError {
    /// Malformed body or out-of-range field.
    InvalidRequest(String),
    /// Body exceeded the configured limit.
    PayloadTooLarge,
    /// No job with this id.
    NotFound(String),
    /// Status store unreachable.
    Store(String),
    /// Work queue unreachable.
    Queue(String),
    /// Anything else.
    Internal(String),
}

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Store(_) | AppError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            AppError::NotFound(_) => "JOB_NOT_FOUND",
            AppError::Store(_) => "CACHE_ERROR",
            AppError::Queue(_) => "QUEUE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(reason) => AppError::InvalidRequest(reason),
            DispatchError::NotFound(id) => AppError::NotFound(id),
            DispatchError::Store(e) => AppError::Store(e.to_string()),
            DispatchError::Queue(e) => AppError::Queue(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::InvalidRequest(rejection.body_text())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = match self {
            AppError::InvalidRequest(reason) => json!({
                "error_code": code,
                "message": "Invalid request",
                "details": { "reason": reason },
            }),
            AppError::PayloadTooLarge => json!({
                "error_code": code,
                "message": "Request body too large",
            }),
            AppError::NotFound(id) => json!({
                "error_code": code,
                "message": format!("Job {id} not found"),
            }),
            AppError::Store(detail) | AppError::Queue(detail) | AppError::Internal(detail) => {
                warn!(error_code = code, error = %detail, "request failed");
                json!({
                    "error_code": code,
                    "message": detail,
                })
            }
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================
