//! # In-Memory Queue Broker
//!
//! A process-local broker with the same contract as the Redis backend:
//! named durable queues (they outlive every channel), manual acknowledgment,
//! and redelivery of messages whose channel closed before settling them.
//! Connect failures can be injected to exercise the retry path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::connections::queue::{Delivery, QueueChannel, QueueConnector, QueueError};

/// How long `next_delivery` waits on an empty queue before returning `None`.
const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(100);

/// Counters for one queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered but not yet settled.
    pub unacked: usize,
    /// Messages settled with `ack`.
    pub acked: u64,
    /// Messages settled with `nack` and discarded.
    pub rejected: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<String, StoredMessage>,
    acked: u64,
    rejected: u64,
}

impl QueueState {
    fn requeue(&mut self, tag: &str) {
        if let Some(mut message) = self.unacked.remove(tag) {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Notify,
    next_tag: AtomicU64,
    connect_attempts: AtomicU32,
    failures_pending: AtomicU32,
}

/// # Memory Broker
///
/// Cheap to clone; clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
    poll_window: Option<Duration>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how long an idle `next_delivery` waits.
    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = Some(window);
        self
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Producer-side publish without opening a channel.
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                payload: payload.into(),
                redelivered: false,
            });
        self.inner.published.notify_waiters();
    }

    /// Whether `queue` has been declared or published to.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues().contains_key(queue)
    }

    /// Counters for `queue`. Unknown queues report zeros.
    pub fn stats(&self, queue: &str) -> QueueStats {
        self.queues()
            .get(queue)
            .map(|state| QueueStats {
                ready: state.ready.len(),
                unacked: state.unacked.len(),
                acked: state.acked,
                rejected: state.rejected,
            })
            .unwrap_or_default()
    }

    /// Bodies of the messages waiting in `queue`, oldest first.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues()
            .get(queue)
            .map(|state| state.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueConnector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn QueueChannel>, QueueError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .inner
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::Connect(format!("{url}: connection refused")));
        }

        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            queue: None,
            held: Vec::new(),
            open: true,
        }))
    }
}

/// A channel on a `MemoryBroker`.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    queue: Option<String>,
    /// Tags delivered on this channel and not yet settled.
    held: Vec<String>,
    open: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.open {
            Ok(())
        } else {
            Err(QueueError::Closed)
        }
    }

    fn try_take(&mut self, queue: &str) -> Option<Delivery> {
        let mut queues = self.broker.queues();
        let state = queues.entry(queue.to_string()).or_default();
        let message = state.ready.pop_front()?;

        let tag = self.broker.inner.next_tag.fetch_add(1, Ordering::SeqCst).to_string();
        state.unacked.insert(tag.clone(), message.clone());
        self.held.push(tag.clone());

        Some(Delivery {
            tag,
            payload: message.payload,
            redelivered: message.redelivered,
        })
    }

    fn settle(&mut self, tag: &str) -> Result<(String, StoredMessage), QueueError> {
        let queue = self.queue.clone().ok_or(QueueError::NotDeclared)?;
        let position = self
            .held
            .iter()
            .position(|held| held == tag)
            .ok_or_else(|| QueueError::Broker(format!("unknown delivery tag {tag}")))?;
        self.held.swap_remove(position);

        let message = self
            .broker
            .queues()
            .get_mut(&queue)
            .and_then(|state| state.unacked.remove(tag))
            .ok_or_else(|| QueueError::Broker(format!("unknown delivery tag {tag}")))?;
        Ok((queue, message))
    }

    fn release_held(&mut self) {
        let Some(queue) = self.queue.clone() else {
            return;
        };
        let held = std::mem::take(&mut self.held);
        if held.is_empty() {
            return;
        }
        if let Some(state) = self.broker.queues().get_mut(&queue) {
            for tag in held.iter().rev() {
                state.requeue(tag);
            }
        }
        self.broker.inner.published.notify_waiters();
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn assert_queue(&mut self, queue: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.queues().entry(queue.to_string()).or_default();
        self.queue = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_open()?;
        let queue = self.queue.clone().ok_or(QueueError::NotDeclared)?;

        // Register interest before checking, so a publish racing with the
        // check still wakes us.
        let inner = Arc::clone(&self.broker.inner);
        let published = inner.published.notified();
        if let Some(delivery) = self.try_take(&queue) {
            return Ok(Some(delivery));
        }

        let window = self.broker.poll_window.unwrap_or(DEFAULT_POLL_WINDOW);
        if tokio::time::timeout(window, published).await.is_err() {
            return Ok(None);
        }
        Ok(self.try_take(&queue))
    }

    async fn ack(&mut self, delivery: Delivery) -> Result<(), QueueError> {
        self.ensure_open()?;
        let (queue, _) = self.settle(&delivery.tag)?;
        if let Some(state) = self.broker.queues().get_mut(&queue) {
            state.acked += 1;
        }
        Ok(())
    }

    async fn nack(&mut self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        self.ensure_open()?;
        let (queue, mut message) = self.settle(&delivery.tag)?;
        if let Some(state) = self.broker.queues().get_mut(&queue) {
            if requeue {
                message.redelivered = true;
                state.ready.push_front(message);
            } else {
                state.rejected += 1;
            }
        }
        if requeue {
            self.broker.inner.published.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.publish(queue, payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.release_held();
        self.open = false;
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release_held();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "shared_items";

    async fn consumer(broker: &MemoryBroker) -> Box<dyn QueueChannel> {
        let mut channel = broker.connect("memory://").await.unwrap();
        channel.assert_queue(QUEUE).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn delivers_in_publish_order_and_counts_acks() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker).await;
        broker.publish(QUEUE, "a");
        broker.publish(QUEUE, "b");

        let first = channel.next_delivery().await.unwrap().unwrap();
        let second = channel.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        assert_eq!(second.payload, b"b");
        assert_eq!(broker.stats(QUEUE).unacked, 2);

        channel.ack(first).await.unwrap();
        channel.nack(second, false).await.unwrap();

        assert_eq!(
            broker.stats(QUEUE),
            QueueStats { ready: 0, unacked: 0, acked: 1, rejected: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_poll_returns_none() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker).await;
        assert!(channel.next_delivery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new().with_poll_window(Duration::from_secs(5));
        let mut channel = consumer(&broker).await;

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(QUEUE, "late");
        });

        let delivery = channel.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn unsettled_messages_are_redelivered_after_close() {
        let broker = MemoryBroker::new();
        broker.publish(QUEUE, "x");

        let mut first = consumer(&broker).await;
        let delivery = first.next_delivery().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        first.close().await.unwrap();
        assert_eq!(broker.stats(QUEUE).ready, 1);

        let mut second = consumer(&broker).await;
        let again = second.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.payload, b"x");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn nack_with_requeue_puts_message_back() {
        let broker = MemoryBroker::new();
        broker.publish(QUEUE, "x");
        let mut channel = consumer(&broker).await;

        let delivery = channel.next_delivery().await.unwrap().unwrap();
        channel.nack(delivery, true).await.unwrap();

        assert_eq!(broker.stats(QUEUE).ready, 1);
        assert_eq!(broker.stats(QUEUE).rejected, 0);
    }

    #[tokio::test]
    async fn closed_channel_rejects_operations() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker).await;
        channel.close().await.unwrap();

        assert!(matches!(channel.next_delivery().await, Err(QueueError::Closed)));
        assert!(matches!(channel.publish(QUEUE, b"x").await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn consuming_requires_a_declared_queue() {
        let broker = MemoryBroker::new();
        let mut channel = broker.connect("memory://").await.unwrap();
        assert!(matches!(channel.next_delivery().await, Err(QueueError::NotDeclared)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_per_attempt() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect("memory://").await.is_err());
        assert!(broker.connect("memory://").await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
