//! # inference-dispatch
//!
//! Asynchronous chat job dispatch over Tokio. Requests are admitted over HTTP,
//! routed to a local GPU model or a remote inference API through durable work
//! queues, and polled for completion by job id.
//!
//! ## Architecture
//!
//! ```text
//! client ─POST─▶ AdmissionService ──▶ JobStore (pending)
//!                      │
//!                      └─ route() ──▶ WorkQueue["gpu" | "api"]
//!                                          │
//!                    JobWorker (gpu) ◀─────┤──────▶ JobWorker (api)
//!                        │  └─ unavailable + auto ─▶ republish on "api"
//!                        ▼
//!                    JobStore (processing → completed | failed)
//! client ─GET /chat/status/{id}─▶ JobStore
//! ```

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod admission;
pub mod availability;
pub mod backend;
pub mod config;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod store;
pub mod worker;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use admission::{AdmissionService, Disposition, ModeInfo, SubmitOutcome};
pub use availability::{AvailabilityFlag, BackendAvailability};
pub use backend::{
    BackendError, EchoBackend, InferenceBackend, LocalGpuBackend, RemoteApiBackend,
};
pub use job::{
    BackendKind, ChatRequest, JobId, JobMessage, JobRecord, JobResult, JobStatus, Mode,
    SubmitRequest, TransitionError,
};
pub use queue::{Delivery, InMemoryQueue, QueueError, WorkQueue};
pub use router::{route, RouteRejection};
pub use store::{IdempotencyClaim, InMemoryJobStore, JobStore, StoreError};
pub use worker::{JobWorker, ProcessOutcome};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use inference_dispatch::{init_tracing, DispatchError};
/// # fn example() -> Result<(), DispatchError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), DispatchError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    init_tracing_with_format(&format)
}

/// Initialise the global tracing subscriber with an explicit format name.
///
/// `"json"` selects JSON output; every other value selects pretty output.
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if a global subscriber is already set.
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing_with_format(format: &str) -> Result<(), DispatchError> {
    let result = match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DispatchError::Other(format!("tracing init failed: {e}")))
}

/// Top-level dispatch errors.
///
/// Every error surface of admission and job execution is mapped to a variant
/// here. Layer-specific errors convert via `#[from]`.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The submitted request violated a field constraint. No job was created.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No job record exists for the given id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The requested execution backend is known to be unavailable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A model invocation failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The status store could not be read or written.
    #[error(transparent)]
    Store(#[from] store::StoreError),

    /// The work queue could not accept or deliver a message.
    #[error(transparent)]
    Queue(#[from] queue::QueueError),

    /// A job record rejected a status change.
    #[error(transparent)]
    Transition(#[from] job::TransitionError),

    /// A configuration value is missing or invalid (e.g., missing env var).
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first job.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl From<config::validation::ConfigError> for DispatchError {
    fn from(err: config::validation::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}
