//! Integration tests for `src/backend.rs`
//!
//! Exercises the HTTP-backed inference clients against `wiremock` servers:
//! - Successful chat completions for the remote and local clients
//! - Request body shape (bearer auth, reasoning turn, thinking budget)
//! - Error classification: 503 / unreachable → Unavailable, others → Inference
//! - The local `/health` probe

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use inference_dispatch::{BackendError, ChatRequest, InferenceBackend, LocalGpuBackend, RemoteApiBackend};

fn completion(text: &str) -> serde_json::Value {
    json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
}

fn remote(server: &MockServer) -> RemoteApiBackend {
    RemoteApiBackend::new("test-key", "test-model").with_base_url(server.uri())
}

fn local(server: &MockServer) -> LocalGpuBackend {
    LocalGpuBackend::new()
        .with_url(server.uri())
        .with_model("local-model")
        .with_probe_timeout(Duration::from_millis(500))
}

// ============================================================================
// Remote API
// ============================================================================

#[tokio::test]
async fn test_remote_success_returns_trimmed_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"model": "test-model", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("  hello there \n")))
        .expect(1)
        .mount(&server)
        .await;

    let out = remote(&server)
        .infer(&ChatRequest::new("hi"))
        .await
        .expect("test: remote infer");
    assert_eq!(out, "hello there");
}

#[tokio::test]
async fn test_remote_reasoning_sends_think_turn_and_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": "/think"},
                {"role": "user", "content": "why is the sky blue?"}
            ],
            "min_thinking_tokens": 256,
            "max_thinking_tokens": 1024
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Rayleigh")))
        .expect(1)
        .mount(&server)
        .await;

    let mut request = ChatRequest::new("why is the sky blue?");
    request.use_reasoning = true;
    let out = remote(&server).infer(&request).await.expect("test: reasoning infer");
    assert_eq!(out, "Rayleigh");
}

#[tokio::test]
async fn test_remote_http_error_is_inference_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let err = remote(&server).infer(&ChatRequest::new("hi")).await.unwrap_err();
    match err {
        BackendError::Inference(msg) => assert!(msg.contains("401")),
        other => panic!("expected inference error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_503_is_not_unavailable() {
    // The API queue has no fallback; every remote failure is terminal.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = remote(&server).infer(&ChatRequest::new("hi")).await.unwrap_err();
    assert!(matches!(err, BackendError::Inference(_)));
}

#[tokio::test]
async fn test_remote_empty_choices_is_inference_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let err = remote(&server).infer(&ChatRequest::new("hi")).await.unwrap_err();
    assert!(matches!(err, BackendError::Inference(_)));
}

#[tokio::test]
async fn test_remote_timeout_is_inference_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let backend = remote(&server).with_timeout(Duration::from_millis(100));
    let err = backend.infer(&ChatRequest::new("hi")).await.unwrap_err();
    assert!(matches!(err, BackendError::Inference(_)));
}

// ============================================================================
// Local GPU server
// ============================================================================

#[tokio::test]
async fn test_local_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "local-model", "max_tokens": 512})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("from gpu")))
        .expect(1)
        .mount(&server)
        .await;

    let out = local(&server)
        .infer(&ChatRequest::new("hi"))
        .await
        .expect("test: local infer");
    assert_eq!(out, "from gpu");
}

#[tokio::test]
async fn test_local_503_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = local(&server).infer(&ChatRequest::new("hi")).await.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)));
}

#[tokio::test]
async fn test_local_500_is_inference_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("CUDA out of memory"))
        .mount(&server)
        .await;

    let err = local(&server).infer(&ChatRequest::new("hi")).await.unwrap_err();
    match err {
        BackendError::Inference(msg) => assert!(msg.contains("CUDA out of memory")),
        other => panic!("expected inference error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_local_health_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;
    assert!(local(&server).is_available().await);

    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;
    assert!(!local(&down).is_available().await);
}

#[tokio::test]
async fn test_local_slow_health_probe_counts_as_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    assert!(!local(&server).is_available().await);
}
