//! Observability integration tests
//!
//! Tests in this module verify:
//! - `init_metrics()` succeeds and is idempotent
//! - `gather_metrics()` returns Prometheus text naming the dispatch counters
//!   once a job has gone through admission and a worker
//! - `init_tracing_with_format()` reports double initialisation as an error
//!
//! NOTE: Log-content assertions are intentionally omitted. Log output from
//! tasks spawned on the multi-threaded runtime cannot be captured reliably
//! from an integration test.

use std::sync::Arc;

use inference_dispatch::config::QueueNames;
use inference_dispatch::{
    init_tracing_with_format, metrics, AdmissionService, AvailabilityFlag, BackendKind,
    EchoBackend, InMemoryJobStore, InMemoryQueue, JobWorker, Mode, SubmitRequest, WorkQueue,
};

// ── init_metrics ──────────────────────────────────────────────────────

#[test]
fn test_init_metrics_double_call_is_idempotent() {
    assert!(metrics::init_metrics().is_ok());
    assert!(
        metrics::init_metrics().is_ok(),
        "second init_metrics must be a no-op returning Ok"
    );
}

// ── gather_metrics ────────────────────────────────────────────────────

#[tokio::test]
async fn test_gather_metrics_reports_job_lifecycle() {
    metrics::init_metrics().expect("test: init metrics");

    let store = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let admission = AdmissionService::new(
        store.clone(),
        queue.clone(),
        Arc::new(AvailabilityFlag::new(false)),
        QueueNames::default(),
    );
    let worker = JobWorker::new(
        BackendKind::Api,
        "observability",
        store,
        queue.clone(),
        Arc::new(EchoBackend::with_delay(0)),
    );

    admission
        .submit(SubmitRequest::new("count me"), Mode::Api)
        .await
        .expect("test: submit");
    admission
        .submit(SubmitRequest::new("rejected"), Mode::Gpu)
        .await
        .expect("test: submit rejected");
    let delivery = queue
        .consume(worker.queue_name())
        .await
        .expect("test: consume");
    worker
        .handle_delivery(&delivery)
        .await
        .expect("test: handle");

    let output = metrics::gather_metrics();
    for name in [
        "dispatch_jobs_submitted_total",
        "dispatch_jobs_rejected_total",
        "dispatch_jobs_finished_total",
        "dispatch_inference_duration_seconds",
    ] {
        assert!(output.contains(name), "missing {name} in:\n{output}");
    }
    assert!(output.contains("GPU_UNAVAILABLE"));
}

#[test]
fn test_metrics_helpers_safe_to_call() {
    // Helpers never panic, initialised or not.
    metrics::inc_submitted("auto");
    metrics::inc_deduplicated();
    metrics::inc_rejected("GPU_UNAVAILABLE");
    metrics::inc_finished("gpu", "completed");
    metrics::inc_fallback();
    metrics::record_inference_latency("api", std::time::Duration::from_millis(3));
    metrics::set_queue_depth("chat_api_requests", 7);
    let _ = metrics::gather_metrics();
}

// ── init_tracing ──────────────────────────────────────────────────────

#[test]
fn test_second_tracing_init_is_an_error_not_a_panic() {
    let _ = init_tracing_with_format("pretty");
    assert!(init_tracing_with_format("json").is_err());
}
