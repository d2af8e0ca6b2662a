//! In-process [`WorkQueue`].
//!
//! Each named queue is a `VecDeque` of payloads plus a table of in-flight
//! deliveries. Consumers park on a `Notify` until a message arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{DeadLetter, Delivery, QueueError, WorkQueue};
use crate::job::JobMessage;

#[derive(Debug, Default)]
struct Channel {
    ready: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<u64, String>>,
    notify: Notify,
}

impl Channel {
    fn push_back(&self, payload: String) {
        self.ready.lock().push_back(payload);
        self.notify.notify_one();
    }

    fn push_front(&self, payload: String) {
        self.ready.lock().push_front(payload);
        self.notify.notify_one();
    }
}

/// Queue living in process memory. Clone the `Arc` to share it.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    channels: DashMap<String, Arc<Channel>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryQueue {
    /// Empty queue set.
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> Arc<Channel> {
        self.channels.entry(name.to_string()).or_default().clone()
    }

    /// Deliveries taken from `queue` and not yet settled.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.channels
            .get(queue)
            .map_or(0, |c| c.in_flight.lock().len())
    }

    /// Enqueue an already-encoded payload without validating it.
    pub fn publish_raw(&self, queue: &str, payload: impl Into<String>) {
        self.channel(queue).push_back(payload.into());
    }

    /// Wake every waiting consumer with [`QueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels.iter() {
            channel.notify.notify_waiters();
        }
    }

    fn take_in_flight(&self, delivery: &Delivery) -> Result<(Arc<Channel>, String), QueueError> {
        let channel = self.channel(&delivery.queue);
        let payload = channel.in_flight.lock().remove(&delivery.tag);
        match payload {
            Some(payload) => Ok((channel, payload)),
            None => Err(QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            }),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, queue: &str, message: &JobMessage) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(queue.to_string()));
        }
        let payload = message.encode()?;
        self.channel(queue).push_back(payload);
        debug!(queue, job_id = %message.job_id, "published");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Delivery, QueueError> {
        let channel = self.channel(queue);
        loop {
            let notified = channel.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close() in between is not missed.
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed(queue.to_string()));
            }

            let next = channel.ready.lock().pop_front();
            if let Some(payload) = next {
                let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                channel.in_flight.lock().insert(tag, payload.clone());
                return Ok(Delivery {
                    queue: queue.to_string(),
                    tag,
                    payload,
                });
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.take_in_flight(delivery).map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let (channel, payload) = self.take_in_flight(delivery)?;
        channel.push_front(payload);
        debug!(queue = %delivery.queue, tag = delivery.tag, "requeued");
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<(), QueueError> {
        let (_, payload) = self.take_in_flight(delivery)?;
        let letter = DeadLetter::from_delivery(
            &Delivery {
                payload,
                ..delivery.clone()
            },
            reason,
        );
        self.channel(dead_letter_queue)
            .push_back(serde_json::to_string(&letter)?);
        warn!(queue = %delivery.queue, dlq = dead_letter_queue, reason, "dead-lettered");
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        Ok(self
            .channels
            .get(queue)
            .map_or(0, |c| c.ready.lock().len()))
    }
}
