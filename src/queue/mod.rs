//! # Stage: Work Queue
//!
//! ## Responsibility
//! Carry [`JobMessage`]s from admission to workers over named channels with
//! at-least-once delivery and explicit acknowledgement.
//!
//! ## Guarantees
//! - A delivered message stays owned by its consumer until `ack`, `nack` or
//!   `dead_letter`; an unacknowledged delivery is never silently lost
//! - `nack` puts the message back at the head of its queue
//! - `consume` blocks until a message is available, with no fixed timeout
//! - FIFO per queue for first deliveries
//!
//! ## NOT Responsible For
//! - Deduplicating redeliveries (see: `worker`, which checks terminal status
//!   and the processing lease)
//! - Choosing the queue (see: `router`)

pub mod memory;
#[cfg(feature = "distributed")]
pub mod redis;

pub use memory::InMemoryQueue;
#[cfg(feature = "distributed")]
pub use self::redis::RedisQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobMessage;

/// Errors raised by a [`WorkQueue`].
#[derive(Error, Debug)]
pub enum QueueError {
    /// The broker could not be reached or rejected a command.
    #[error("queue backend error: {0}")]
    Backend(String),

    /// A message could not be encoded or decoded.
    #[error("queue codec error: {0}")]
    Codec(String),

    /// `ack`/`nack` referenced a delivery this queue does not hold.
    #[error("unknown delivery {tag} on queue {queue}")]
    UnknownDelivery {
        /// Queue the delivery claimed to come from.
        queue: String,
        /// Delivery tag.
        tag: u64,
    },

    /// The queue was shut down while a consumer was waiting.
    #[error("queue {0} closed")]
    Closed(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Codec(err.to_string())
    }
}

/// One message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was taken from.
    pub queue: String,
    /// Consumer-local delivery tag.
    pub tag: u64,
    /// Raw wire payload.
    pub payload: String,
}

impl Delivery {
    /// Decode the payload.
    pub fn message(&self) -> Result<JobMessage, QueueError> {
        Ok(JobMessage::decode(&self.payload)?)
    }
}

/// Envelope written to a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue the payload was consumed from.
    pub source_queue: String,
    /// Why it was parked.
    pub reason: String,
    /// Original payload, verbatim.
    pub payload: String,
    /// When it was parked.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Wrap a delivery for parking.
    pub fn from_delivery(delivery: &Delivery, reason: impl Into<String>) -> Self {
        Self {
            source_queue: delivery.queue.clone(),
            reason: reason.into(),
            payload: delivery.payload.clone(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Named channels with at-least-once delivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a message to `queue`.
    async fn publish(&self, queue: &str, message: &JobMessage) -> Result<(), QueueError>;

    /// Wait for the next message on `queue`.
    async fn consume(&self, queue: &str) -> Result<Delivery, QueueError>;

    /// Confirm the delivery was fully handled.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return the delivery to the head of its queue.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move the delivery to `dead_letter_queue` and drop it from its source.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Ready (not in-flight) messages on `queue`.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;

    /// Requeue deliveries this consumer took but never acknowledged, e.g.
    /// after a crash. Returns how many were requeued.
    async fn recover_unacked(&self, queue: &str) -> Result<usize, QueueError> {
        let _ = queue;
        Ok(0)
    }
}
