//! # Stage: Worker
//!
//! ## Responsibility
//! Consume job messages for one backend, drive each record through
//! `processing` to a terminal status, and take the single GPU→API hop for
//! auto-mode jobs whose GPU backend is unavailable.
//!
//! ## Guarantees
//! - Messages are acknowledged only after the record writes (and any fallback
//!   republish) succeed; infrastructure errors requeue the delivery
//! - Terminal records are never reprocessed; a per-job lease stops two
//!   workers running the same job concurrently
//! - Status never regresses; the fallback hop re-stamps the current status
//! - Undecodable payloads go to the dead-letter queue instead of looping
//!
//! ## NOT Responsible For
//! - Routing new submissions (see: `router`, `admission`)
//! - Publishing GPU liveness (see: `availability::spawn_heartbeat`)

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, InferenceBackend};
use crate::config::{QueueNames, WorkersSection};
use crate::job::{BackendKind, JobMessage, JobRecord, JobResult};
use crate::metrics;
use crate::queue::{Delivery, QueueError, WorkQueue};
use crate::store::JobStore;
use crate::DispatchError;

/// What a worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Backend answered; record is `completed`.
    Completed,
    /// Record is `failed`.
    Failed,
    /// Job was republished onto the API queue.
    FellBack,
    /// Nothing to do; the reason is logged.
    Discarded(&'static str),
    /// Payload could not be decoded and was dead-lettered.
    DeadLettered,
}

/// Consumption loop for one backend queue.
///
/// A `JobWorker` is shared through an `Arc` by every loop of a pool; it holds
/// no per-job state.
pub struct JobWorker {
    kind: BackendKind,
    worker_id: String,
    queues: QueueNames,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    backend: Arc<dyn InferenceBackend>,
    timeout: Duration,
    lease_grace: Duration,
    error_backoff: Duration,
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("kind", &self.kind)
            .field("worker_id", &self.worker_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl JobWorker {
    /// Worker for `kind` with default queue names and timings.
    pub fn new(
        kind: BackendKind,
        worker_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            kind,
            worker_id: worker_id.into(),
            queues: QueueNames::default(),
            store,
            queue,
            backend,
            timeout: Duration::ZERO,
            lease_grace: Duration::ZERO,
            error_backoff: Duration::ZERO,
        }
        .with_settings(&WorkersSection::default())
    }

    /// Take timeout, lease grace and error backoff from `settings`.
    pub fn with_settings(mut self, settings: &WorkersSection) -> Self {
        self.timeout = settings.timeout_for(self.kind);
        self.lease_grace = Duration::from_secs(settings.lease_grace_s);
        self.error_backoff = Duration::from_millis(settings.error_backoff_ms);
        self
    }

    /// Use custom queue names.
    pub fn with_queues(mut self, queues: QueueNames) -> Self {
        self.queues = queues;
        self
    }

    /// Override the backend call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backend this worker serves.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Queue this worker consumes.
    pub fn queue_name(&self) -> &str {
        self.queues.for_backend(self.kind)
    }

    /// Spawn `concurrency` consumption loops sharing this worker.
    pub fn spawn_pool(
        self: Arc<Self>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|slot| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(slot, shutdown).await })
            })
            .collect()
    }

    /// Consume until `shutdown` flips to `true` or the queue closes.
    ///
    /// # Panics
    /// This function never panics.
    pub async fn run(self: Arc<Self>, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let queue_name = self.queue_name().to_string();
        info!(backend = %self.kind, worker_id = %self.worker_id, slot, queue = %queue_name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delivery = tokio::select! {
                delivery = self.queue.consume(&queue_name) => delivery,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match delivery {
                Ok(delivery) => match self.handle_delivery(&delivery).await {
                    Ok(outcome) => {
                        debug!(backend = %self.kind, slot, tag = delivery.tag, ?outcome, "delivery settled");
                    }
                    Err(e) => {
                        warn!(backend = %self.kind, slot, tag = delivery.tag, error = %e, "delivery requeued");
                        tokio::time::sleep(self.error_backoff).await;
                    }
                },
                Err(QueueError::Closed(_)) => break,
                Err(e) => {
                    warn!(backend = %self.kind, slot, error = %e, "consume failed");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        info!(backend = %self.kind, worker_id = %self.worker_id, slot, "worker stopped");
    }

    /// Process one delivery and settle it with the queue.
    ///
    /// # Returns
    /// - `Ok(outcome)` once the delivery is acknowledged or dead-lettered
    /// - `Err(_)` when an infrastructure error occurred; the delivery has been
    ///   requeued (or, if even that failed, is left for recovery)
    ///
    /// # Panics
    /// This function never panics.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<ProcessOutcome, DispatchError> {
        let message = match delivery.message() {
            Ok(message) => message,
            Err(e) => {
                let dlq = self.queues.dead_letter_for(self.kind);
                self.queue
                    .dead_letter(delivery, dlq, &e.to_string())
                    .await?;
                return Ok(ProcessOutcome::DeadLettered);
            }
        };

        match self.process(&message).await {
            Ok(outcome) => {
                self.queue.ack(delivery).await?;
                Ok(outcome)
            }
            // Redelivery cannot fix an illegal transition.
            Err(DispatchError::Transition(e)) => {
                warn!(job_id = %message.job_id, error = %e, "dropping message");
                self.queue.ack(delivery).await?;
                Ok(ProcessOutcome::Discarded("illegal transition"))
            }
            Err(e) => {
                if let Err(nack_err) = self.queue.nack(delivery).await {
                    warn!(job_id = %message.job_id, error = %nack_err, "nack failed");
                }
                Err(e)
            }
        }
    }

    /// Run one job message against the store and backend. Does not touch the
    /// delivery.
    ///
    /// # Panics
    /// This function never panics.
    pub async fn process(&self, message: &JobMessage) -> Result<ProcessOutcome, DispatchError> {
        let job_id = message.job_id;
        match self.store.get(job_id).await? {
            None => return Ok(self.discard(message, "record missing")),
            Some(record) if record.status.is_terminal() => {
                return Ok(self.discard(message, "already terminal"))
            }
            Some(_) => {}
        }

        let holder = format!("{}/{}", self.worker_id, Uuid::new_v4());
        let lease_ttl = self.timeout + self.lease_grace;
        if !self.store.try_acquire_lease(job_id, &holder, lease_ttl).await? {
            return Ok(self.discard(message, "lease held elsewhere"));
        }

        let outcome = self.execute(message, &holder).await;

        if let Err(e) = self.store.release_lease(job_id, &holder).await {
            warn!(job_id = %job_id, error = %e, "could not release lease");
        }
        outcome
    }

    async fn execute(&self, message: &JobMessage, holder: &str) -> Result<ProcessOutcome, DispatchError> {
        // Re-read under the lease; another worker may have finished it.
        let mut record = match self.store.get(message.job_id).await? {
            Some(record) if !record.status.is_terminal() => record,
            Some(_) => return Ok(self.discard(message, "already terminal")),
            None => return Ok(self.discard(message, "record missing")),
        };

        if self.may_fall_back(message) && !self.backend.is_available().await {
            return self
                .fall_back(message, &mut record, holder, "gpu backend probe reports unavailable")
                .await;
        }

        record.mark_processing()?;
        self.store.put(&record).await?;
        debug!(job_id = %message.job_id, backend = %self.kind, "processing");

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.backend.infer(&message.request)).await;
        let elapsed = started.elapsed();
        metrics::record_inference_latency(self.kind.as_str(), elapsed);

        match result {
            Ok(Ok(response)) => {
                let latency_ms = elapsed.as_secs_f64() * 1000.0;
                record.complete(JobResult::new(response, self.kind, latency_ms))?;
                self.store.put(&record).await?;
                metrics::inc_finished(self.kind.as_str(), "completed");
                info!(job_id = %message.job_id, backend = %self.kind, latency_ms, "job completed");
                Ok(ProcessOutcome::Completed)
            }
            Ok(Err(BackendError::Unavailable(reason))) if self.may_fall_back(message) => {
                self.fall_back(message, &mut record, holder, &reason).await
            }
            Ok(Err(e)) => self.fail(&mut record, e.to_string()).await,
            Err(_) => {
                let error = format!(
                    "{} backend timed out after {:.1}s",
                    self.kind,
                    self.timeout.as_secs_f64()
                );
                self.fail(&mut record, error).await
            }
        }
    }

    fn may_fall_back(&self, message: &JobMessage) -> bool {
        self.kind == BackendKind::Gpu && message.can_fall_back()
    }

    async fn fall_back(
        &self,
        message: &JobMessage,
        record: &mut JobRecord,
        holder: &str,
        reason: &str,
    ) -> Result<ProcessOutcome, DispatchError> {
        // A redelivered GPU message whose republish was lost finds the flag
        // already set and only republishes.
        if !record.fallback_attempted {
            record.record_fallback()?;
            self.store.put(record).await?;
        }
        if let Err(e) = self.store.release_lease(message.job_id, holder).await {
            warn!(job_id = %message.job_id, error = %e, "could not release lease before fallback");
        }
        self.queue
            .publish(&self.queues.api, &message.clone().into_fallback())
            .await?;
        metrics::inc_fallback();
        info!(job_id = %message.job_id, reason, queue = %self.queues.api, "fell back to api");
        Ok(ProcessOutcome::FellBack)
    }

    async fn fail(&self, record: &mut JobRecord, error: String) -> Result<ProcessOutcome, DispatchError> {
        warn!(job_id = %record.job_id, backend = %self.kind, error = %error, "job failed");
        record.fail(error, Some(self.kind))?;
        self.store.put(record).await?;
        metrics::inc_finished(self.kind.as_str(), "failed");
        Ok(ProcessOutcome::Failed)
    }

    fn discard(&self, message: &JobMessage, reason: &'static str) -> ProcessOutcome {
        debug!(job_id = %message.job_id, backend = %self.kind, reason, "discarding message");
        ProcessOutcome::Discarded(reason)
    }
}
