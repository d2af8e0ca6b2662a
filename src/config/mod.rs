//! # Stage: Service Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file shared by the API server and workers.
//! One file describes the whole deployment:
//! ```text
//! dispatch-api --config dispatch.toml
//! dispatch-worker --backend gpu --config dispatch.toml
//! ```
//!
//! ## Guarantees
//! - Every field has a documented default; an empty file is a valid config
//! - Validated: semantic constraints are checked before a config is accepted
//! - Environment overrides (`REDIS_URL`, `HOST`, `PORT`, `LOG_FORMAT`) are
//!   applied before validation
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building stores, queues and backends (see: `runtime`)

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::backend::{DEFAULT_MODEL, DEFAULT_REMOTE_BASE_URL};
use crate::job::BackendKind;
use crate::store::RetentionPolicy;

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Default request body limit: 1 MiB.
fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "chat:".to_string()
}

fn default_gpu_queue() -> String {
    "chat_gpu_requests".to_string()
}

fn default_api_queue() -> String {
    "chat_api_requests".to_string()
}

fn default_gpu_dead_letter() -> String {
    "chat_gpu_dlq".to_string()
}

fn default_api_dead_letter() -> String {
    "chat_api_dlq".to_string()
}

/// Default retention for keys and records: 24 hours.
fn default_ttl_s() -> u64 {
    86_400
}

fn default_gpu_timeout_s() -> u64 {
    60
}

/// Remote calls tolerate longer waits than the local accelerator.
fn default_api_timeout_s() -> u64 {
    120
}

fn default_gpu_concurrency() -> usize {
    1
}

fn default_api_concurrency() -> usize {
    3
}

fn default_heartbeat_interval_s() -> u64 {
    5
}

fn default_availability_ttl_s() -> u64 {
    15
}

fn default_lease_grace_s() -> u64 {
    30
}

fn default_error_backoff_ms() -> u64 {
    500
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_gpu_backend() -> BackendSection {
    BackendSection {
        provider: BackendProvider::LocalServer,
        url: Some("http://localhost:8000".to_string()),
        model: default_model(),
        api_key_env: None,
        probe_timeout_ms: default_probe_timeout_ms(),
    }
}

fn default_api_backend() -> BackendSection {
    BackendSection {
        provider: BackendProvider::OpenAiCompatible,
        url: Some(DEFAULT_REMOTE_BASE_URL.to_string()),
        model: default_model(),
        api_key_env: Some("NVIDIA_API_KEY".to_string()),
        probe_timeout_ms: default_probe_timeout_ms(),
    }
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for the API server and workers.
///
/// # Example
///
/// ```toml
/// [storage]
/// backend = "redis"
/// redis_url = "redis://redis:6379"
///
/// [workers]
/// api_concurrency = 4
///
/// [backends.gpu]
/// provider = "local_server"
/// url = "http://gpu-host:8000"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServiceConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSection,
    /// Where job records and queues live.
    #[serde(default)]
    pub storage: StorageSection,
    /// Queue names.
    #[serde(default)]
    pub queues: QueueNames,
    /// Retention windows for idempotency keys and job records.
    #[serde(default)]
    pub retention: RetentionSection,
    /// Worker timeouts, concurrency and liveness settings.
    #[serde(default)]
    pub workers: WorkersSection,
    /// Backend clients.
    #[serde(default)]
    pub backends: BackendsSection,
    /// Logging.
    #[serde(default)]
    pub observability: ObservabilitySection,
}

// ── Sections ─────────────────────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// In-process store and queue. The API server runs workers embedded.
    #[default]
    Memory,
    /// Shared Redis for store, queues and availability.
    Redis,
}

/// Where job records and queues live.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StorageSection {
    /// Backend selector.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Redis URL, used when `backend = "redis"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prepended to every Redis key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Stable consumer id for this process; `$HOSTNAME` when absent.
    /// Required (from either source) for the redis backend.
    #[serde(default)]
    pub consumer_id: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            consumer_id: None,
        }
    }
}

/// Queue names.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct QueueNames {
    /// Jobs for the local GPU backend.
    #[serde(default = "default_gpu_queue")]
    pub gpu: String,
    /// Jobs for the remote API backend.
    #[serde(default = "default_api_queue")]
    pub api: String,
    /// Undecodable deliveries from the GPU queue.
    #[serde(default = "default_gpu_dead_letter")]
    pub gpu_dead_letter: String,
    /// Undecodable deliveries from the API queue.
    #[serde(default = "default_api_dead_letter")]
    pub api_dead_letter: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            gpu: default_gpu_queue(),
            api: default_api_queue(),
            gpu_dead_letter: default_gpu_dead_letter(),
            api_dead_letter: default_api_dead_letter(),
        }
    }
}

impl QueueNames {
    /// Work queue feeding `backend`.
    pub fn for_backend(&self, backend: BackendKind) -> &str {
        match backend {
            BackendKind::Gpu => &self.gpu,
            BackendKind::Api => &self.api,
        }
    }

    /// Dead-letter queue paired with `backend`'s work queue.
    pub fn dead_letter_for(&self, backend: BackendKind) -> &str {
        match backend {
            BackendKind::Gpu => &self.gpu_dead_letter,
            BackendKind::Api => &self.api_dead_letter,
        }
    }
}

/// Retention windows.
///
/// `idempotency_ttl_s` must not exceed `job_ttl_s`, so a live key always
/// points at a record that is either live or still being created.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RetentionSection {
    /// Lifetime of an idempotency key.
    #[serde(default = "default_ttl_s")]
    pub idempotency_ttl_s: u64,
    /// Lifetime of a job record after its latest write.
    #[serde(default = "default_ttl_s")]
    pub job_ttl_s: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            idempotency_ttl_s: default_ttl_s(),
            job_ttl_s: default_ttl_s(),
        }
    }
}

impl RetentionSection {
    /// Convert to the store's policy type.
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_s),
            job_ttl: Duration::from_secs(self.job_ttl_s),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct WorkersSection {
    /// Bound on one GPU backend call.
    #[serde(default = "default_gpu_timeout_s")]
    pub gpu_timeout_s: u64,
    /// Bound on one remote API call.
    #[serde(default = "default_api_timeout_s")]
    pub api_timeout_s: u64,
    /// Consumption loops per GPU worker process.
    #[serde(default = "default_gpu_concurrency")]
    pub gpu_concurrency: usize,
    /// Consumption loops per API worker process.
    #[serde(default = "default_api_concurrency")]
    pub api_concurrency: usize,
    /// How often GPU workers publish liveness.
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    /// How long a heartbeat keeps the GPU marked available.
    #[serde(default = "default_availability_ttl_s")]
    pub availability_ttl_s: u64,
    /// Extra lease lifetime on top of the backend timeout.
    #[serde(default = "default_lease_grace_s")]
    pub lease_grace_s: u64,
    /// Pause after an infrastructure error before consuming again.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            gpu_timeout_s: default_gpu_timeout_s(),
            api_timeout_s: default_api_timeout_s(),
            gpu_concurrency: default_gpu_concurrency(),
            api_concurrency: default_api_concurrency(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            availability_ttl_s: default_availability_ttl_s(),
            lease_grace_s: default_lease_grace_s(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl WorkersSection {
    /// Backend call bound for `backend`.
    pub fn timeout_for(&self, backend: BackendKind) -> Duration {
        match backend {
            BackendKind::Gpu => Duration::from_secs(self.gpu_timeout_s),
            BackendKind::Api => Duration::from_secs(self.api_timeout_s),
        }
    }

    /// Default loop count for `backend`.
    pub fn concurrency_for(&self, backend: BackendKind) -> usize {
        match backend {
            BackendKind::Gpu => self.gpu_concurrency,
            BackendKind::Api => self.api_concurrency,
        }
    }
}

/// Which client implementation a backend uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendProvider {
    /// Echo the prompt back (demos, tests).
    Echo,
    /// Local OpenAI-compatible inference server.
    LocalServer,
    /// Hosted OpenAI-compatible API with bearer auth.
    OpenAiCompatible,
}

/// One backend client.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendSection {
    /// Client implementation.
    pub provider: BackendProvider,
    /// Server or API base URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Model name sent with each request.
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key (`open_ai_compatible` only).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Health probe timeout (`local_server` only).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Backend clients.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendsSection {
    /// Client for the GPU queue.
    #[serde(default = "default_gpu_backend")]
    pub gpu: BackendSection,
    /// Client for the API queue.
    #[serde(default = "default_api_backend")]
    pub api: BackendSection,
}

impl Default for BackendsSection {
    fn default() -> Self {
        Self {
            gpu: default_gpu_backend(),
            api: default_api_backend(),
        }
    }
}

impl BackendsSection {
    /// Section for `backend`.
    pub fn for_backend(&self, backend: BackendKind) -> &BackendSection {
        match backend {
            BackendKind::Gpu => &self.gpu,
            BackendKind::Api => &self.api,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Name understood by [`crate::init_tracing_with_format`].
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ObservabilitySection {
    /// Output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Export the JSON Schema for [`ServiceConfig`] as a pretty-printed string.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> String {
    let schema = schemars::schema_for!(ServiceConfig);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
