//! # Stage: Admission
//!
//! ## Responsibility
//! Turn a chat submission into a tracked job: validate, deduplicate by
//! idempotency key, persist a `pending` record, route, publish, and hand the
//! caller a job reference without waiting for inference.
//!
//! ## Guarantees
//! - The record is persisted before the message is published, so a worker
//!   never sees a message whose record does not exist
//! - One record per live idempotency key, whatever the concurrency
//! - Forced GPU on an unavailable backend is failed synchronously and never
//!   queued
//! - A store or queue failure fails the call; the idempotency claim is
//!   released so the caller may retry with the same key
//!
//! ## NOT Responsible For
//! - Executing jobs (see: `worker`)
//! - HTTP concerns (see: `web_api`)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::availability::BackendAvailability;
use crate::config::QueueNames;
use crate::job::{BackendKind, JobId, JobMessage, JobRecord, JobStatus, Mode, SubmitRequest};
use crate::metrics;
use crate::queue::WorkQueue;
use crate::router::{route, RouteRejection};
use crate::store::{IdempotencyClaim, JobStore};
use crate::DispatchError;

/// What admission did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// New job, published to the given backend's queue.
    Enqueued(BackendKind),
    /// The idempotency key was already live; nothing was published.
    Deduplicated,
    /// New job, failed at admission without queueing.
    Rejected(RouteRejection),
}

/// Job reference returned by [`AdmissionService::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    /// Job id, new or existing.
    pub job_id: JobId,
    /// Status at the time of the call.
    pub status: JobStatus,
    /// Caller's key, or the one generated for this job.
    pub idempotency_key: String,
    /// What admission did.
    pub disposition: Disposition,
    /// Failure description when `status` is `failed`.
    pub error: Option<String>,
    /// Why admission refused the job, for new and deduplicated submissions
    /// alike.
    pub rejection: Option<RouteRejection>,
}

/// Which modes can be served right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModes {
    /// GPU backend reports alive.
    pub gpu: bool,
    /// The remote API is always routable.
    pub api: bool,
}

/// Capability description for clients choosing a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeInfo {
    /// Per-mode availability.
    pub available_modes: AvailableModes,
    /// Where `auto` would route right now.
    pub default_mode: BackendKind,
}

/// Entry point for job submission and status queries.
#[derive(Clone)]
pub struct AdmissionService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    availability: Arc<dyn BackendAvailability>,
    queues: QueueNames,
}

impl std::fmt::Debug for AdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl AdmissionService {
    /// Wire admission to its store, queue and availability source.
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        availability: Arc<dyn BackendAvailability>,
        queues: QueueNames,
    ) -> Self {
        Self {
            store,
            queue,
            availability,
            queues,
        }
    }

    /// Admit a chat submission.
    ///
    /// # Returns
    /// - `Ok(outcome)` with `Disposition::Enqueued` for a new queued job
    /// - `Ok(outcome)` with `Disposition::Deduplicated` for a live key
    /// - `Ok(outcome)` with `Disposition::Rejected` and status `failed` when
    ///   `gpu` was forced while the GPU is unavailable
    /// - `Err(DispatchError::Validation)` for out-of-range fields; no job is created
    /// - `Err(DispatchError::Store | Queue)` when persisting or publishing fails
    ///
    /// # Panics
    /// This function never panics.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        mode: Mode,
    ) -> Result<SubmitOutcome, DispatchError> {
        let (chat, supplied_key) = request.validate()?;
        let job_id = JobId::new();
        let key = supplied_key.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let IdempotencyClaim::Existing(existing) =
            self.store.claim_idempotency_key(&key, job_id).await?
        {
            return self.deduplicated(existing, key).await;
        }

        let mut record = JobRecord::new(job_id, key.clone(), mode);
        if let Err(e) = self.store.insert(&record).await {
            self.release_key(&key, job_id).await;
            return Err(e.into());
        }

        let gpu_available = self.availability.gpu_available().await;
        let target = match route(mode, gpu_available) {
            Ok(target) => target,
            Err(rejection) => return self.reject(record, rejection).await,
        };

        let queue_name = self.queues.for_backend(target);
        let message = JobMessage::new(job_id, chat, mode);
        if let Err(e) = self.queue.publish(queue_name, &message).await {
            warn!(job_id = %job_id, queue = queue_name, error = %e, "publish failed, failing job");
            if record.fail(format!("could not enqueue job: {e}"), None).is_ok() {
                if let Err(store_err) = self.store.put(&record).await {
                    warn!(job_id = %job_id, error = %store_err, "could not mark unqueued job failed");
                }
            }
            self.release_key(&key, job_id).await;
            return Err(e.into());
        }

        metrics::inc_submitted(mode.as_str());
        info!(job_id = %job_id, mode = %mode, queue = queue_name, gpu_available, "job admitted");

        Ok(SubmitOutcome {
            job_id,
            status: JobStatus::Pending,
            idempotency_key: key,
            disposition: Disposition::Enqueued(target),
            error: None,
            rejection: None,
        })
    }

    /// Current record for `job_id`.
    ///
    /// Unparsable ids are reported as [`DispatchError::NotFound`] like
    /// unknown ones.
    ///
    /// # Panics
    /// This function never panics.
    pub async fn status(&self, job_id: &str) -> Result<JobRecord, DispatchError> {
        let id: JobId = job_id
            .parse()
            .map_err(|_| DispatchError::NotFound(job_id.to_string()))?;
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(job_id.to_string()))
    }

    /// Which modes can be served right now.
    pub async fn info(&self) -> ModeInfo {
        let gpu = self.availability.gpu_available().await;
        ModeInfo {
            available_modes: AvailableModes { gpu, api: true },
            default_mode: if gpu {
                BackendKind::Gpu
            } else {
                BackendKind::Api
            },
        }
    }

    /// Ready messages on `backend`'s queue.
    pub async fn queue_depth(&self, backend: BackendKind) -> Result<usize, DispatchError> {
        Ok(self.queue.depth(self.queues.for_backend(backend)).await?)
    }

    /// Queue names this service publishes to.
    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    async fn deduplicated(
        &self,
        existing: JobId,
        key: String,
    ) -> Result<SubmitOutcome, DispatchError> {
        // A live key whose record is not visible yet belongs to a submission
        // still between claim and insert.
        let record = self.store.get(existing).await?;
        let (status, error, rejection) = record.map_or((JobStatus::Pending, None, None), |r| {
            (r.status, r.error, r.rejection)
        });
        metrics::inc_deduplicated();
        debug!(job_id = %existing, status = %status, "idempotent resubmission");
        Ok(SubmitOutcome {
            job_id: existing,
            status,
            idempotency_key: key,
            disposition: Disposition::Deduplicated,
            error,
            rejection,
        })
    }

    async fn reject(
        &self,
        mut record: JobRecord,
        rejection: RouteRejection,
    ) -> Result<SubmitOutcome, DispatchError> {
        let message = rejection.to_string();
        let persisted = match record.reject(rejection) {
            Ok(()) => self.store.put(&record).await.map_err(DispatchError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = persisted {
            // The key must not stay bound to a pending record nothing will run.
            self.release_key(&record.idempotency_key, record.job_id).await;
            return Err(e);
        }
        metrics::inc_rejected(rejection.code());
        warn!(job_id = %record.job_id, code = rejection.code(), "job rejected at admission");
        Ok(SubmitOutcome {
            job_id: record.job_id,
            status: record.status,
            idempotency_key: record.idempotency_key,
            disposition: Disposition::Rejected(rejection),
            error: Some(message),
            rejection: Some(rejection),
        })
    }

    async fn release_key(&self, key: &str, job_id: JobId) {
        if let Err(e) = self.store.release_idempotency_key(key, job_id).await {
            warn!(job_id = %job_id, error = %e, "could not release idempotency key");
        }
    }
}
