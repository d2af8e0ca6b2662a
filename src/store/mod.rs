//! # Stage: Job Status Store
//!
//! ## Responsibility
//! Durable key-value mapping from job id to [`JobRecord`], plus the two
//! atomic claims the dispatch flow depends on: idempotency keys at admission
//! and per-job processing leases in workers.
//!
//! ## Guarantees
//! - Single-key operations only; no multi-record transactions
//! - `claim_idempotency_key` is atomic create-if-absent: of any number of
//!   concurrent claims for one live key exactly one sees `Claimed`
//! - `insert` never overwrites an existing record
//! - Records and keys expire after the configured [`RetentionPolicy`]
//!
//! ## NOT Responsible For
//! - Enforcing the status state machine (see: `job::JobRecord`)
//! - Deciding what to write (see: `admission`, `worker`)

pub mod memory;
#[cfg(feature = "distributed")]
pub mod redis;

pub use memory::InMemoryJobStore;
#[cfg(feature = "distributed")]
pub use self::redis::RedisJobStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{JobId, JobRecord};

/// Errors raised by a [`JobStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying store could not be reached or rejected a command.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("store codec error: {0}")]
    Codec(String),

    /// `insert` found a live record under the same id.
    #[error("job {0} already exists")]
    AlreadyExists(JobId),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Outcome of [`JobStore::claim_idempotency_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyClaim {
    /// The key was free and now maps to the caller's job id.
    Claimed,
    /// The key already maps to this live job.
    Existing(JobId),
}

/// How long keys and records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Lifetime of an idempotency key from its claim.
    pub idempotency_ttl: Duration,
    /// Lifetime of a job record from its latest write.
    pub job_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(86_400),
            job_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Persistence contract shared by admission and workers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically map `key` to `job_id` unless a live mapping exists.
    async fn claim_idempotency_key(
        &self,
        key: &str,
        job_id: JobId,
    ) -> Result<IdempotencyClaim, StoreError>;

    /// Drop the mapping for `key` if it still points at `job_id`.
    ///
    /// Returns `true` if a mapping was removed.
    async fn release_idempotency_key(&self, key: &str, job_id: JobId)
        -> Result<bool, StoreError>;

    /// Create a record. Fails with [`StoreError::AlreadyExists`] if one is live.
    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Read a live record.
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Overwrite a record and refresh its retention.
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Take or refresh the processing lease on `job_id` for `holder`.
    ///
    /// Returns `false` when another holder owns a live lease.
    async fn try_acquire_lease(
        &self,
        job_id: JobId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release the lease if `holder` owns it. Returns `true` if released.
    async fn release_lease(&self, job_id: JobId, holder: &str) -> Result<bool, StoreError>;
}
