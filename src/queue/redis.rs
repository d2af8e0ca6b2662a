//! Redis reliable-list [`WorkQueue`].
//!
//! Producers `LPUSH` onto `{prefix}queue:{name}`. A consumer atomically moves
//! the oldest entry into its own processing list
//! `{prefix}queue:{name}:processing:{consumer_id}` with `BLMOVE`, and removes
//! it from there on `ack`. Anything left in a processing list after a crash
//! is moved back by [`WorkQueue::recover_unacked`] when that consumer
//! restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DeadLetter, Delivery, QueueError, WorkQueue};
use crate::job::JobMessage;

/// Reliable queue on a shared Redis instance.
pub struct RedisQueue {
    client: Arc<redis::Client>,
    prefix: String,
    consumer_id: String,
    next_tag: AtomicU64,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("prefix", &self.prefix)
            .field("consumer_id", &self.consumer_id)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Create a queue handle. No connection is made until first use.
    ///
    /// # Arguments
    /// * `redis_url` — Redis connection URL
    /// * `prefix` — Namespace prepended to every key
    /// * `consumer_id` — Stable id of this consumer process; names its
    ///   processing lists so they can be recovered after a restart
    ///
    /// # Returns
    /// - `Err(QueueError::Backend)` if the URL is invalid
    ///
    /// # Panics
    /// This function never panics.
    pub fn new(
        redis_url: &str,
        prefix: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Backend(format!("failed to open Redis client: {e}")))?;
        Ok(Self::from_client(Arc::new(client), prefix, consumer_id))
    }

    /// Create a queue handle from an existing client.
    pub fn from_client(
        client: Arc<redis::Client>,
        prefix: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            consumer_id: consumer_id.into(),
            next_tag: AtomicU64::new(0),
        }
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}queue:{queue}", self.prefix)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}queue:{queue}:processing:{}", self.prefix, self.consumer_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Backend(format!("failed to get connection: {e}")))
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn publish(&self, queue: &str, message: &JobMessage) -> Result<(), QueueError> {
        let payload = message.encode()?;
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.ready_key(queue))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("LPUSH failed: {e}")))?;
        debug!(queue, job_id = %message.job_id, "published");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Delivery, QueueError> {
        // Blocking commands get a dedicated connection so they never stall
        // other traffic multiplexed on a shared one.
        let mut conn = self.connection().await?;
        loop {
            let moved: Option<String> = redis::cmd("BLMOVE")
                .arg(self.ready_key(queue))
                .arg(self.processing_key(queue))
                .arg("RIGHT")
                .arg("LEFT")
                .arg(0)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Backend(format!("BLMOVE failed: {e}")))?;
            if let Some(payload) = moved {
                return Ok(Delivery {
                    queue: queue.to_string(),
                    tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
                    payload,
                });
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("LREM")
            .arg(self.processing_key(&delivery.queue))
            .arg(1)
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("LREM failed: {e}")))?;
        if removed == 0 {
            return Err(QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            });
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key(&delivery.queue))
            .arg(1)
            .arg(&delivery.payload)
            .ignore()
            .cmd("RPUSH")
            .arg(self.ready_key(&delivery.queue))
            .arg(&delivery.payload)
            .ignore()
            .query_async(&mut conn)
            .await;
        result.map_err(|e| QueueError::Backend(format!("requeue failed: {e}")))?;
        debug!(queue = %delivery.queue, tag = delivery.tag, "requeued");
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<(), QueueError> {
        let letter = serde_json::to_string(&DeadLetter::from_delivery(delivery, reason))?;
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key(&delivery.queue))
            .arg(1)
            .arg(&delivery.payload)
            .ignore()
            .cmd("LPUSH")
            .arg(self.ready_key(dead_letter_queue))
            .arg(letter)
            .ignore()
            .query_async(&mut conn)
            .await;
        result.map_err(|e| QueueError::Backend(format!("dead-letter failed: {e}")))?;
        warn!(queue = %delivery.queue, dlq = dead_letter_queue, reason, "dead-lettered");
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("LLEN")
            .arg(self.ready_key(queue))
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("LLEN failed: {e}")))
    }

    async fn recover_unacked(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let mut recovered = 0usize;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(self.processing_key(queue))
                .arg(self.ready_key(queue))
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Backend(format!("LMOVE failed: {e}")))?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(queue, consumer = %self.consumer_id, recovered, "requeued unacknowledged deliveries");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ChatRequest, JobId, Mode};

    fn queue() -> RedisQueue {
        RedisQueue::new("redis://127.0.0.1:1/", "chat:", "gpu-node-1").expect("test: url parses")
    }

    #[test]
    fn test_new_with_invalid_url_fails() {
        assert!(matches!(
            RedisQueue::new("not-a-url", "", "c"),
            Err(QueueError::Backend(_))
        ));
    }

    #[test]
    fn test_key_layout() {
        let q = queue();
        assert_eq!(q.ready_key("chat_gpu_requests"), "chat:queue:chat_gpu_requests");
        assert_eq!(
            q.processing_key("chat_gpu_requests"),
            "chat:queue:chat_gpu_requests:processing:gpu-node-1"
        );
    }

    #[tokio::test]
    async fn test_publish_to_unreachable_redis_fails() {
        let msg = JobMessage::new(JobId::new(), ChatRequest::new("hi"), Mode::Api);
        let err = queue().publish("chat_api_requests", &msg).await.unwrap_err();
        assert!(matches!(err, QueueError::Backend(_)));
    }
}
