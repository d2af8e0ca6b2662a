//! Redis-backed [`JobStore`].
//!
//! ## Key layout
//!
//! | Key | Value | Expiry |
//! |-----|-------|--------|
//! | `{prefix}job:{job_id}` | JSON [`JobRecord`] | `job_ttl`, refreshed on every write |
//! | `{prefix}idem:{key}` | job id | `idempotency_ttl` from claim |
//! | `{prefix}lease:{job_id}` | holder id | lease ttl |
//!
//! Claims use `SET NX EX`; releases use a compare-and-delete script so a
//! caller never drops a claim it does not own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{IdempotencyClaim, JobStore, RetentionPolicy, StoreError};
use crate::job::{JobId, JobRecord};

/// Delete `KEYS[1]` only if it still holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Set `KEYS[1]` to `ARGV[1]` with a `ARGV[2]` ms expiry unless another
/// holder owns it.
const ACQUIRE_LEASE: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if current == false or current == ARGV[1] then
        redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
        return 1
    else
        return 0
    end
"#;

/// Attempts at claiming a key that expires between `SET NX` and `GET`.
const CLAIM_ATTEMPTS: usize = 3;

/// Job store on a shared Redis instance.
#[derive(Clone)]
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    prefix: String,
    retention: RetentionPolicy,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("prefix", &self.prefix)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    /// Create a store for `redis_url`. No connection is made until first use.
    ///
    /// # Arguments
    /// * `redis_url` — Redis connection URL (e.g., `redis://localhost:6379`)
    /// * `prefix` — Namespace prepended to every key
    /// * `retention` — Key and record lifetimes
    ///
    /// # Returns
    /// - `Err(StoreError::Backend)` if the URL is invalid
    ///
    /// # Panics
    /// This function never panics.
    pub fn new(
        redis_url: &str,
        prefix: impl Into<String>,
        retention: RetentionPolicy,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Backend(format!("failed to open Redis client: {e}")))?;
        Ok(Self::from_client(Arc::new(client), prefix, retention))
    }

    /// Create a store from an existing client.
    pub fn from_client(
        client: Arc<redis::Client>,
        prefix: impl Into<String>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            retention,
        }
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}job:{job_id}", self.prefix)
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}idem:{key}", self.prefix)
    }

    fn lease_key(&self, job_id: JobId) -> String {
        format!("{}lease:{job_id}", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to get connection: {e}")))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn claim_idempotency_key(
        &self,
        key: &str,
        job_id: JobId,
    ) -> Result<IdempotencyClaim, StoreError> {
        let redis_key = self.idempotency_key(key);
        let mut conn = self.connection().await?;

        for _ in 0..CLAIM_ATTEMPTS {
            let set: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(job_id.to_string())
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs(self.retention.idempotency_ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(format!("SET NX EX failed: {e}")))?;
            if set.as_deref() == Some("OK") {
                debug!(key, job_id = %job_id, "claimed idempotency key");
                return Ok(IdempotencyClaim::Claimed);
            }

            let existing: Option<String> = redis::cmd("GET")
                .arg(&redis_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(format!("GET failed: {e}")))?;
            if let Some(raw) = existing {
                let owner = raw.parse::<JobId>().map_err(|e| {
                    StoreError::Codec(format!("idempotency key {key} holds '{raw}': {e}"))
                })?;
                return Ok(IdempotencyClaim::Existing(owner));
            }
            // Expired between SET and GET; try again.
        }

        Err(StoreError::Backend(format!(
            "idempotency key {key} kept expiring during claim"
        )))
    }

    async fn release_idempotency_key(
        &self,
        key: &str,
        job_id: JobId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(self.idempotency_key(key))
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("release script failed: {e}")))?;
        Ok(removed == 1)
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.connection().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.job_key(record.job_id))
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(self.retention.job_ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("SET NX EX failed: {e}")))?;
        match set {
            Some(ref s) if s == "OK" => Ok(()),
            _ => Err(StoreError::AlreadyExists(record.job_id)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("GET failed: {e}")))?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(self.job_key(record.job_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl_secs(self.retention.job_ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("SET EX failed: {e}")))
    }

    async fn try_acquire_lease(
        &self,
        job_id: JobId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let acquired: i64 = redis::Script::new(ACQUIRE_LEASE)
            .key(self.lease_key(job_id))
            .arg(holder)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("lease script failed: {e}")))?;
        Ok(acquired == 1)
    }

    async fn release_lease(&self, job_id: JobId, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(self.lease_key(job_id))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("release script failed: {e}")))?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Mode;

    fn store() -> RedisJobStore {
        RedisJobStore::new("redis://127.0.0.1:1/", "chat:", RetentionPolicy::default())
            .expect("test: url parses")
    }

    #[test]
    fn test_new_with_invalid_url_fails() {
        let result = RedisJobStore::new("not-a-url", "", RetentionPolicy::default());
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[test]
    fn test_key_layout() {
        let s = store();
        let id = JobId::new();
        assert_eq!(s.job_key(id), format!("chat:job:{id}"));
        assert_eq!(s.idempotency_key("abc"), "chat:idem:abc");
        assert_eq!(s.lease_key(id), format!("chat:lease:{id}"));
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_debug_hides_client() {
        let rendered = format!("{:?}", store());
        assert!(rendered.contains("chat:"));
        assert!(!rendered.contains("client"));
    }

    #[tokio::test]
    async fn test_unreachable_redis_surfaces_backend_error() {
        let record = JobRecord::new(JobId::new(), "k", Mode::Auto);
        let err = store().insert(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
