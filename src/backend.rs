//! Inference backend abstraction and implementations
//!
//! Provides the [`InferenceBackend`] trait and the clients workers call:
//! - [`EchoBackend`]: testing/demo backend
//! - [`RemoteApiBackend`]: hosted OpenAI-compatible chat completions API
//!   (NVIDIA integrate endpoint by default)
//! - [`LocalGpuBackend`]: OpenAI-compatible inference server running on the
//!   local accelerator (vLLM, llama.cpp server, ...)
//!
//! ## Environment Variables
//!
//! - `NVIDIA_API_KEY`: default key variable for [`RemoteApiBackend::from_env`]
//! - `GPU_SERVER_URL`: local server URL for [`LocalGpuBackend::new`]
//!   (default: `http://localhost:8000`)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::ChatRequest;
use crate::DispatchError;

/// Default hosted API base URL.
pub const DEFAULT_REMOTE_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";
/// Default model on both backends.
pub const DEFAULT_MODEL: &str = "nvidia/nvidia-nemotron-nano-9b-v2";
/// Nucleus sampling used for every request.
pub const DEFAULT_TOP_P: f32 = 0.95;
/// Thinking-token budget sent when reasoning is enabled.
pub const THINKING_TOKENS: (u32, u32) = (256, 1024);

/// Failure of a single backend invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend cannot serve requests right now (down, unreachable,
    /// overloaded). Auto-mode GPU jobs fall back to the API on this error.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend was reached but the call failed.
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => DispatchError::BackendUnavailable(msg),
            BackendError::Inference(msg) => DispatchError::Inference(msg),
        }
    }
}

/// Contract between workers and model backends.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn InferenceBackend>`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Generate a reply for `request`.
    async fn infer(&self, request: &ChatRequest) -> Result<String, BackendError>;

    /// Cheap liveness probe. Backends that cannot tell report `true`.
    async fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// Echo Backend (Testing)
// ============================================================================

/// Echo backend for testing
///
/// Returns the prompt unchanged after a simulated delay.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    /// Simulated inference delay
    pub delay_ms: u64,
}

impl EchoBackend {
    /// Echo backend with a 10ms delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Echo backend with a custom delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    async fn infer(&self, request: &ChatRequest) -> Result<String, BackendError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(request.message.clone())
    }
}

// ============================================================================
// OpenAI-compatible chat completions wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
    #[serde(flatten)]
    thinking: Option<ThinkingBudget>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ThinkingBudget {
    min_thinking_tokens: u32,
    max_thinking_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Reasoning mode prepends a `/think` system turn and sets a thinking budget.
fn chat_body<'a>(model: &'a str, top_p: f32, request: &'a ChatRequest) -> ChatCompletionRequest<'a> {
    let mut messages = Vec::with_capacity(2);
    if request.use_reasoning {
        messages.push(ChatMessage {
            role: "system",
            content: "/think",
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &request.message,
    });

    ChatCompletionRequest {
        model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p,
        stream: false,
        thinking: request.use_reasoning.then_some(ThinkingBudget {
            min_thinking_tokens: THINKING_TOKENS.0,
            max_thinking_tokens: THINKING_TOKENS.1,
        }),
    }
}

async fn read_completion(response: reqwest::Response, label: &str) -> Result<String, BackendError> {
    let parsed: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|e| BackendError::Inference(format!("{label}: failed to parse response: {e}")))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| BackendError::Inference(format!("{label}: no choices in response")))
}

// ============================================================================
// Remote API Backend
// ============================================================================

/// Hosted OpenAI-compatible chat completions backend.
///
/// ## Example
///
/// ```no_run
/// use inference_dispatch::RemoteApiBackend;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), inference_dispatch::DispatchError> {
/// let backend = RemoteApiBackend::from_env("NVIDIA_API_KEY", "nvidia/nvidia-nemotron-nano-9b-v2")?
///     .with_timeout(Duration::from_secs(120));
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct RemoteApiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    top_p: f32,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteApiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApiBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteApiBackend {
    /// Create a backend with an explicit API key.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            top_p: DEFAULT_TOP_P,
            timeout: Duration::from_secs(120),
        }
    }

    /// Create a backend reading the API key from `key_var`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] if the variable is unset or empty,
    /// so a misconfigured worker fails at startup rather than on its first job.
    pub fn from_env(key_var: &str, model: impl Into<String>) -> Result<Self, DispatchError> {
        match std::env::var(key_var) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key, model)),
            _ => Err(DispatchError::Config(format!(
                "{key_var} environment variable not set"
            ))),
        }
    }

    /// Override the API base URL (everything before `/chat/completions`).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set top_p sampling parameter
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl InferenceBackend for RemoteApiBackend {
    async fn infer(&self, request: &ChatRequest) -> Result<String, BackendError> {
        let body = chat_body(&self.model, self.top_p, request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Inference(format!("remote API request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Inference(format!(
                "remote API error {status}: {error_text}"
            )));
        }

        read_completion(response, "remote API").await
    }
}

// ============================================================================
// Local GPU Backend
// ============================================================================

/// OpenAI-compatible inference server on the local accelerator.
///
/// Connection failures and `503 Service Unavailable` are reported as
/// [`BackendError::Unavailable`]; every other failure is an inference error.
/// [`InferenceBackend::is_available`] probes `GET {url}/health`.
#[derive(Debug, Clone)]
pub struct LocalGpuBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    top_p: f32,
    timeout: Duration,
    probe_timeout: Duration,
}

impl LocalGpuBackend {
    /// Create a local backend.
    ///
    /// Reads server URL from the `GPU_SERVER_URL` environment variable,
    /// or defaults to `http://localhost:8000`.
    pub fn new() -> Self {
        let url =
            std::env::var("GPU_SERVER_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
        Self {
            client: reqwest::Client::new(),
            url,
            model: DEFAULT_MODEL.to_string(),
            top_p: DEFAULT_TOP_P,
            timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),
        }
    }

    /// Set server URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set served model name
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set health probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl Default for LocalGpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for LocalGpuBackend {
    async fn infer(&self, request: &ChatRequest) -> Result<String, BackendError> {
        let body = chat_body(&self.model, self.top_p, request);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    BackendError::Unavailable(format!("local GPU server unreachable: {e}"))
                } else {
                    BackendError::Inference(format!("local GPU request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(BackendError::Unavailable(
                "local GPU server returned 503".to_string(),
            ));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Inference(format!(
                "local GPU error {status}: {error_text}"
            )));
        }

        read_completion(response, "local GPU").await
    }

    async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.url))
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_backend_returns_message() {
        let backend = EchoBackend::with_delay(0);
        let out = backend
            .infer(&ChatRequest::new("hello world"))
            .await
            .expect("test: echo");
        assert_eq!(out, "hello world");
        assert!(backend.is_available().await);
    }

    #[test]
    fn test_chat_body_plain() {
        let req = ChatRequest::new("hi");
        let body = serde_json::to_value(chat_body("m", 0.95, &req)).expect("test: serialize");
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["stream"], false);
        assert!(body.get("min_thinking_tokens").is_none());
    }

    #[test]
    fn test_chat_body_reasoning_adds_think_and_budget() {
        let mut req = ChatRequest::new("why?");
        req.use_reasoning = true;
        let body = serde_json::to_value(chat_body("m", 0.95, &req)).expect("test: serialize");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "/think");
        assert_eq!(body["messages"][1]["content"], "why?");
        assert_eq!(body["min_thinking_tokens"], 256);
        assert_eq!(body["max_thinking_tokens"], 1024);
    }

    #[test]
    fn test_remote_from_env_missing_key_is_config_error() {
        let result = RemoteApiBackend::from_env("DISPATCH_TEST_SURELY_UNSET_KEY", DEFAULT_MODEL);
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_remote_debug_hides_api_key() {
        let backend = RemoteApiBackend::new("sk-secret", DEFAULT_MODEL);
        assert!(!format!("{backend:?}").contains("sk-secret"));
    }

    #[test]
    fn test_backend_error_maps_to_dispatch_error() {
        let unavailable: DispatchError = BackendError::Unavailable("down".into()).into();
        assert!(matches!(unavailable, DispatchError::BackendUnavailable(_)));
        let failed: DispatchError = BackendError::Inference("bad".into()).into();
        assert!(matches!(failed, DispatchError::Inference(_)));
    }

    #[tokio::test]
    async fn test_local_unreachable_server_is_unavailable() {
        let backend = LocalGpuBackend::new()
            .with_url("http://127.0.0.1:1")
            .with_probe_timeout(Duration::from_millis(200));
        assert!(!backend.is_available().await);
        let err = backend.infer(&ChatRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
