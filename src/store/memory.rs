//! In-process [`JobStore`] backed by `DashMap`.
//!
//! Used when admission and workers share a process and throughout the test
//! suite. Expiry is lazy: entries past their deadline are treated as absent
//! on access and removed by [`InMemoryJobStore::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{IdempotencyClaim, JobStore, RetentionPolicy, StoreError};
use crate::job::{JobId, JobRecord};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// DashMap-backed store with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Expiring<JobRecord>>,
    keys: DashMap<String, Expiring<JobId>>,
    leases: DashMap<JobId, Expiring<String>>,
    retention: RetentionPolicy,
}

impl InMemoryJobStore {
    /// Empty store with the default 24h retention.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store with an explicit retention policy.
    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    /// Number of live job records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.jobs.iter().filter(|e| e.is_live(now)).count()
    }

    /// `true` when no live records exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record, key and lease. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.jobs.len() + self.keys.len() + self.leases.len();
        self.jobs.retain(|_, e| e.is_live(now));
        self.keys.retain(|_, e| e.is_live(now));
        self.leases.retain(|_, e| e.is_live(now));
        let after = self.jobs.len() + self.keys.len() + self.leases.len();
        let removed = before.saturating_sub(after);
        if removed > 0 {
            debug!(removed, "purged expired store entries");
        }
        removed
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_idempotency_key(
        &self,
        key: &str,
        job_id: JobId,
    ) -> Result<IdempotencyClaim, StoreError> {
        let now = Instant::now();
        let ttl = self.retention.idempotency_ttl;
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    Ok(IdempotencyClaim::Existing(entry.get().value))
                } else {
                    entry.insert(Expiring::new(job_id, ttl));
                    Ok(IdempotencyClaim::Claimed)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Expiring::new(job_id, ttl));
                Ok(IdempotencyClaim::Claimed)
            }
        }
    }

    async fn release_idempotency_key(
        &self,
        key: &str,
        job_id: JobId,
    ) -> Result<bool, StoreError> {
        Ok(self.keys.remove_if(key, |_, e| e.value == job_id).is_some())
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let now = Instant::now();
        match self.jobs.entry(record.job_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Err(StoreError::AlreadyExists(record.job_id));
                }
                entry.insert(Expiring::new(record.clone(), self.retention.job_ttl));
            }
            Entry::Vacant(entry) => {
                entry.insert(Expiring::new(record.clone(), self.retention.job_ttl));
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let now = Instant::now();
        // Copy out before touching the map again; removing while holding a
        // read guard on the same shard deadlocks.
        let found = self
            .jobs
            .get(&job_id)
            .map(|e| (e.is_live(now), e.value.clone()));
        match found {
            Some((true, record)) => Ok(Some(record)),
            Some((false, _)) => {
                self.jobs.remove_if(&job_id, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.jobs.insert(
            record.job_id,
            Expiring::new(record.clone(), self.retention.job_ttl),
        );
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        job_id: JobId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.leases.entry(job_id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.is_live(now) && current.value != holder {
                    return Ok(false);
                }
                entry.insert(Expiring::new(holder.to_string(), ttl));
            }
            Entry::Vacant(entry) => {
                entry.insert(Expiring::new(holder.to_string(), ttl));
            }
        }
        Ok(true)
    }

    async fn release_lease(&self, job_id: JobId, holder: &str) -> Result<bool, StoreError> {
        Ok(self
            .leases
            .remove_if(&job_id, |_, e| e.value == holder)
            .is_some())
    }
}
