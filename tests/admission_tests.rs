//! Integration tests for `src/admission.rs`
//!
//! Covers the submission contract against the in-memory adapters:
//! read-after-write, idempotency, validation, forced-GPU rejection,
//! concurrent duplicate submissions and store outages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use inference_dispatch::config::QueueNames;
use inference_dispatch::store::{IdempotencyClaim, StoreError};
use inference_dispatch::{
    AdmissionService, AvailabilityFlag, BackendKind, DispatchError, Disposition, InMemoryJobStore,
    InMemoryQueue, JobId, JobRecord, JobStatus, JobStore, Mode, SubmitRequest, WorkQueue,
};

/// In-memory store whose writes can be switched off to simulate an outage.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryJobStore,
    fail_insert: AtomicBool,
    fail_put: AtomicBool,
}

impl FlakyStore {
    fn outage() -> StoreError {
        StoreError::Backend("connection refused".into())
    }

    fn recover(&self) {
        self.fail_insert.store(false, Ordering::SeqCst);
        self.fail_put.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn claim_idempotency_key(
        &self,
        key: &str,
        job_id: JobId,
    ) -> Result<IdempotencyClaim, StoreError> {
        self.inner.claim_idempotency_key(key, job_id).await
    }

    async fn release_idempotency_key(&self, key: &str, job_id: JobId) -> Result<bool, StoreError> {
        self.inner.release_idempotency_key(key, job_id).await
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.insert(record).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.put(record).await
    }

    async fn try_acquire_lease(
        &self,
        job_id: JobId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.try_acquire_lease(job_id, holder, ttl).await
    }

    async fn release_lease(&self, job_id: JobId, holder: &str) -> Result<bool, StoreError> {
        self.inner.release_lease(job_id, holder).await
    }
}

struct FlakyHarness {
    service: AdmissionService,
    store: Arc<FlakyStore>,
    queue: Arc<InMemoryQueue>,
    flag: AvailabilityFlag,
}

fn flaky_service(gpu_available: bool) -> FlakyHarness {
    let store = Arc::new(FlakyStore::default());
    let queue = Arc::new(InMemoryQueue::new());
    let flag = AvailabilityFlag::new(gpu_available);
    let service = AdmissionService::new(
        store.clone(),
        queue.clone(),
        Arc::new(flag.clone()),
        QueueNames::default(),
    );
    FlakyHarness {
        service,
        store,
        queue,
        flag,
    }
}

fn service(gpu_available: bool) -> (AdmissionService, Arc<InMemoryQueue>) {
    let queue = Arc::new(InMemoryQueue::new());
    let service = AdmissionService::new(
        Arc::new(InMemoryJobStore::new()),
        queue.clone(),
        Arc::new(AvailabilityFlag::new(gpu_available)),
        QueueNames::default(),
    );
    (service, queue)
}

async fn total_depth(queue: &InMemoryQueue) -> usize {
    queue.depth("chat_gpu_requests").await.expect("test: depth")
        + queue.depth("chat_api_requests").await.expect("test: depth")
}

#[tokio::test]
async fn test_status_right_after_submit_is_pending() {
    let (service, _) = service(true);
    let out = service
        .submit(SubmitRequest::new("hello"), Mode::Auto)
        .await
        .expect("test: submit");

    let record = service
        .status(&out.job_id.to_string())
        .await
        .expect("test: status");
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.mode_requested, Mode::Auto);
    assert_eq!(record.idempotency_key, out.idempotency_key);
    assert!(record.result.is_none());
    assert!(record.error.is_none());
}

#[tokio::test]
async fn test_same_idempotency_key_returns_same_job() {
    let (service, queue) = service(true);
    let request = SubmitRequest::new("hello").with_idempotency_key("client-key-1");

    let first = service
        .submit(request.clone(), Mode::Auto)
        .await
        .expect("test: first submit");
    let depth_after_first = total_depth(&queue).await;

    let second = service
        .submit(request, Mode::Api)
        .await
        .expect("test: second submit");

    assert_eq!(first.job_id, second.job_id);
    assert_eq!(second.disposition, Disposition::Deduplicated);
    assert_eq!(second.idempotency_key, "client-key-1");
    assert_eq!(total_depth(&queue).await, depth_after_first);
}

#[tokio::test]
async fn test_concurrent_duplicates_create_one_job() {
    let (service, queue) = service(false);
    let request = SubmitRequest::new("hello").with_idempotency_key("burst");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let service = service.clone();
            let request = request.clone();
            tokio::spawn(async move { service.submit(request, Mode::Auto).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("test: join").expect("test: submit").job_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(total_depth(&queue).await, 1);
}

#[tokio::test]
async fn test_distinct_keys_create_distinct_jobs() {
    let (service, queue) = service(false);
    let a = service
        .submit(SubmitRequest::new("same text"), Mode::Api)
        .await
        .expect("test: submit a");
    let b = service
        .submit(SubmitRequest::new("same text"), Mode::Api)
        .await
        .expect("test: submit b");
    assert_ne!(a.job_id, b.job_id);
    assert_ne!(a.idempotency_key, b.idempotency_key);
    assert_eq!(total_depth(&queue).await, 2);
}

#[tokio::test]
async fn test_routing_by_mode() {
    let (service, queue) = service(false);
    let out = service
        .submit(SubmitRequest::new("hello"), Mode::Auto)
        .await
        .expect("test: submit");
    assert_eq!(out.disposition, Disposition::Enqueued(BackendKind::Api));
    assert_eq!(queue.depth("chat_api_requests").await.expect("test: depth"), 1);
    assert_eq!(queue.depth("chat_gpu_requests").await.expect("test: depth"), 0);
}

#[tokio::test]
async fn test_forced_gpu_rejected_when_unavailable() {
    let (service, queue) = service(false);
    let out = service
        .submit(SubmitRequest::new("hello").with_idempotency_key("gpu-only"), Mode::Gpu)
        .await
        .expect("test: submit");

    assert!(matches!(out.disposition, Disposition::Rejected(_)));
    assert_eq!(out.status, JobStatus::Failed);
    assert!(out.error.as_deref().is_some_and(|e| e.contains("GPU")));
    assert_eq!(total_depth(&queue).await, 0);

    let record = service
        .status(&out.job_id.to_string())
        .await
        .expect("test: status");
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.mode_used.is_none());

    // The key stays bound to the failed job.
    let again = service
        .submit(SubmitRequest::new("hello").with_idempotency_key("gpu-only"), Mode::Gpu)
        .await
        .expect("test: resubmit");
    assert_eq!(again.job_id, out.job_id);
    assert_eq!(again.status, JobStatus::Failed);
    assert_eq!(again.disposition, Disposition::Deduplicated);
    assert_eq!(again.rejection, out.rejection);
    assert!(again.rejection.is_some());
}

#[tokio::test]
async fn test_validation_rejects_out_of_range_fields() {
    let (service, queue) = service(true);
    let cases = [
        SubmitRequest::new("   "),
        SubmitRequest {
            max_tokens: Some(0),
            ..SubmitRequest::new("hi")
        },
        SubmitRequest {
            max_tokens: Some(2049),
            ..SubmitRequest::new("hi")
        },
        SubmitRequest {
            temperature: Some(1.5),
            ..SubmitRequest::new("hi")
        },
        SubmitRequest::new("hi").with_idempotency_key(""),
        SubmitRequest::new("hi").with_idempotency_key("k".repeat(257)),
    ];
    for request in cases {
        let err = service.submit(request, Mode::Auto).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)), "got {err:?}");
    }
    assert_eq!(total_depth(&queue).await, 0);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (service, _) = service(true);
    let err = service
        .status(&uuid::Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(_)));
}

// ── Store outages ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_insert_failure_fails_call_and_frees_key() {
    let h = flaky_service(true);
    h.store.fail_insert.store(true, Ordering::SeqCst);

    let request = SubmitRequest::new("hello").with_idempotency_key("insert-outage");
    let err = h
        .service
        .submit(request.clone(), Mode::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Store(_)), "got {err:?}");
    assert_eq!(total_depth(&h.queue).await, 0);

    h.store.recover();
    let retry = h
        .service
        .submit(request, Mode::Auto)
        .await
        .expect("test: retry");
    assert_eq!(retry.disposition, Disposition::Enqueued(BackendKind::Gpu));
    assert_eq!(total_depth(&h.queue).await, 1);
}

#[tokio::test]
async fn test_rejection_write_failure_frees_key() {
    let h = flaky_service(false);
    h.store.fail_put.store(true, Ordering::SeqCst);

    let request = SubmitRequest::new("hello").with_idempotency_key("reject-outage");
    let err = h
        .service
        .submit(request.clone(), Mode::Gpu)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Store(_)), "got {err:?}");

    // Once the store and the GPU are back, the same key admits a fresh job.
    h.store.recover();
    h.flag.set(true);
    let retry = h
        .service
        .submit(request, Mode::Gpu)
        .await
        .expect("test: retry");
    assert_eq!(retry.disposition, Disposition::Enqueued(BackendKind::Gpu));
    assert_eq!(retry.status, JobStatus::Pending);
    assert_eq!(
        h.queue.depth("chat_gpu_requests").await.expect("test: depth"),
        1
    );
}
