//! # Stage: Backend Availability
//!
//! ## Responsibility
//! Hold the "is the GPU backend alive" signal that admission consults before
//! routing. GPU workers publish it; the router only reads it.
//!
//! ## Guarantees
//! - Reads are cheap and never fail: a store error reads as "unavailable"
//! - Explicit lifecycle: a GPU worker reports on start, on every heartbeat
//!   tick and withdraws on shutdown
//! - Multi-process: with Redis, each GPU worker owns one member of a sorted
//!   set scored by its last heartbeat, so one worker going away does not hide
//!   the others
//!
//! ## NOT Responsible For
//! - Deciding the route (see: `router`)
//! - Probing the model server itself (see: `backend::InferenceBackend::is_available`)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::store::StoreError;

/// Shared view of GPU backend liveness.
#[async_trait]
pub trait BackendAvailability: Send + Sync {
    /// Whether at least one GPU worker currently reports a live backend.
    async fn gpu_available(&self) -> bool;

    /// Publish `reporter`'s view of its GPU backend.
    async fn report_gpu(&self, reporter: &str, available: bool) -> Result<(), StoreError>;
}

/// In-process availability flag.
///
/// Suitable when admission and GPU workers share one process, and in tests.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityFlag {
    gpu: Arc<AtomicBool>,
}

impl AvailabilityFlag {
    /// Flag with the given initial state.
    pub fn new(gpu_available: bool) -> Self {
        Self {
            gpu: Arc::new(AtomicBool::new(gpu_available)),
        }
    }

    /// Overwrite the flag.
    pub fn set(&self, gpu_available: bool) {
        self.gpu.store(gpu_available, Ordering::SeqCst);
    }

    /// Current value.
    pub fn get(&self) -> bool {
        self.gpu.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAvailability for AvailabilityFlag {
    async fn gpu_available(&self) -> bool {
        self.get()
    }

    async fn report_gpu(&self, _reporter: &str, available: bool) -> Result<(), StoreError> {
        self.set(available);
        Ok(())
    }
}

/// Run the GPU heartbeat until `shutdown` flips to `true`.
///
/// Every `interval` the backend's own probe is consulted and the result is
/// reported under `reporter`. On shutdown availability is withdrawn.
///
/// # Panics
/// This function never panics.
pub fn spawn_heartbeat(
    availability: Arc<dyn BackendAvailability>,
    backend: Arc<dyn InferenceBackend>,
    reporter: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(reporter = %reporter, interval_ms = interval.as_millis() as u64, "gpu heartbeat started");
        let mut last: Option<bool> = None;
        loop {
            let alive = backend.is_available().await;
            if last != Some(alive) {
                info!(reporter = %reporter, alive, "gpu availability changed");
                last = Some(alive);
            }
            if let Err(e) = availability.report_gpu(&reporter, alive).await {
                warn!(reporter = %reporter, error = %e, "failed to publish gpu heartbeat");
            } else {
                debug!(reporter = %reporter, alive, "gpu heartbeat");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = availability.report_gpu(&reporter, false).await {
            warn!(reporter = %reporter, error = %e, "failed to withdraw gpu availability");
        }
        info!(reporter = %reporter, "gpu heartbeat stopped");
    })
}

// ============================================================================
// Redis
// ============================================================================

#[cfg(feature = "distributed")]
pub use self::redis_impl::RedisAvailability;

#[cfg(feature = "distributed")]
mod redis_impl {
    use super::*;

    /// GPU liveness shared across processes through a Redis sorted set.
    ///
    /// Members are reporter ids, scores are heartbeat times in epoch millis.
    /// The backend is available while any member is fresher than `ttl`.
    #[derive(Clone)]
    pub struct RedisAvailability {
        client: Arc<redis::Client>,
        key: String,
        ttl: Duration,
    }

    impl std::fmt::Debug for RedisAvailability {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisAvailability")
                .field("key", &self.key)
                .field("ttl", &self.ttl)
                .finish_non_exhaustive()
        }
    }

    impl RedisAvailability {
        /// Open a client for `redis_url`. No connection is made until first use.
        ///
        /// # Returns
        /// - `Err(StoreError::Backend)` if the URL is invalid
        ///
        /// # Panics
        /// This function never panics.
        pub fn new(redis_url: &str, key_prefix: &str, ttl: Duration) -> Result<Self, StoreError> {
            let client = redis::Client::open(redis_url)
                .map_err(|e| StoreError::Backend(format!("failed to open Redis client: {e}")))?;
            Ok(Self::from_client(Arc::new(client), key_prefix, ttl))
        }

        /// Wrap an existing client.
        pub fn from_client(client: Arc<redis::Client>, key_prefix: &str, ttl: Duration) -> Self {
            Self {
                client,
                key: availability_key(key_prefix),
                ttl,
            }
        }

        /// Sorted-set key holding heartbeats.
        pub fn key(&self) -> &str {
            &self.key
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::Backend(format!("failed to get connection: {e}")))
        }

        async fn live_reporters(&self) -> Result<u64, StoreError> {
            let mut conn = self.connection().await?;
            let cutoff = now_millis().saturating_sub(self.ttl.as_millis() as i64);
            redis::cmd("ZCOUNT")
                .arg(&self.key)
                .arg(cutoff)
                .arg("+inf")
                .query_async::<_, u64>(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(format!("ZCOUNT failed: {e}")))
        }
    }

    #[async_trait]
    impl BackendAvailability for RedisAvailability {
        async fn gpu_available(&self) -> bool {
            match self.live_reporters().await {
                Ok(count) => count > 0,
                Err(e) => {
                    warn!(error = %e, "gpu availability probe failed, treating as unavailable");
                    false
                }
            }
        }

        async fn report_gpu(&self, reporter: &str, available: bool) -> Result<(), StoreError> {
            let mut conn = self.connection().await?;
            let now = now_millis();
            if available {
                let cutoff = now.saturating_sub(self.ttl.as_millis() as i64);
                let result: redis::RedisResult<()> = redis::pipe()
                    .atomic()
                    .cmd("ZADD")
                    .arg(&self.key)
                    .arg(now)
                    .arg(reporter)
                    .ignore()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(&self.key)
                    .arg("-inf")
                    .arg(format!("({cutoff}"))
                    .ignore()
                    .query_async(&mut conn)
                    .await;
                result.map_err(|e| StoreError::Backend(format!("heartbeat failed: {e}")))
            } else {
                let result: redis::RedisResult<i64> = redis::cmd("ZREM")
                    .arg(&self.key)
                    .arg(reporter)
                    .query_async(&mut conn)
                    .await;
                result
                    .map(|_| ())
                    .map_err(|e| StoreError::Backend(format!("ZREM failed: {e}")))
            }
        }
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Heartbeat set key for a given prefix.
    pub(crate) fn availability_key(prefix: &str) -> String {
        format!("{prefix}backend:gpu:alive")
    }

}
