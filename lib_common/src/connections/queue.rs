//! # Durable Queue Client
//!
//! Broker-neutral contract for the queue the relay consumes.
//!
//! A `QueueConnector` opens a `QueueChannel`. A channel is single-owner: the
//! consumer task holds it for its whole life and nothing else touches it.
//! Deliveries use manual acknowledgment. `ack` and `nack` take the
//! `Delivery` by value, so a delivery can be settled once and only once.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::connections::backoff::{retry_async, RetryPolicy};

/// Queue client failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached or refused the connection.
    #[error("failed to connect to queue broker: {0}")]
    Connect(String),

    /// The channel was used before `assert_queue`.
    #[error("no queue has been asserted on this channel")]
    NotDeclared,

    /// The channel (or its connection) has been closed.
    #[error("queue channel is closed")]
    Closed,

    /// The broker rejected a command.
    #[error("queue broker error: {0}")]
    Broker(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_io_error() {
            QueueError::Closed
        } else {
            QueueError::Broker(e.to_string())
        }
    }
}

/// One message handed to a consumer, awaiting acknowledgment.
pub struct Delivery {
    /// Broker-assigned handle used to settle the delivery.
    pub tag: String,
    /// The message body.
    pub payload: Vec<u8>,
    /// `true` if the broker delivered this message before without it being
    /// settled (for example to a consumer that crashed).
    pub redelivered: bool,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// # Queue Channel
#[async_trait]
pub trait QueueChannel: Send {
    /// Declares `queue` as durable and starts consuming from it. Idempotent.
    async fn assert_queue(&mut self, queue: &str) -> Result<(), QueueError>;

    /// Waits briefly for the next delivery. `Ok(None)` means nothing arrived
    /// within the poll window; callers loop and get a chance to observe
    /// shutdown between polls.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError>;

    /// Settles a delivery as processed.
    async fn ack(&mut self, delivery: Delivery) -> Result<(), QueueError>;

    /// Settles a delivery as failed. With `requeue == false` the broker
    /// discards the message; otherwise it will be delivered again.
    async fn nack(&mut self, delivery: Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Appends a durable message to `queue`.
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Closes the channel and its connection. Unsettled deliveries are left
    /// to the broker's redelivery policy.
    async fn close(&mut self) -> Result<(), QueueError>;
}

/// # Queue Connector
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Opens a connection to the broker at `url` and a channel on it.
    async fn connect(&self, url: &str) -> Result<Box<dyn QueueChannel>, QueueError>;
}

/// Opens a channel, retrying per `policy`.
///
/// # Errors
/// The last connect error once `policy.attempts()` attempts have failed.
pub async fn connect_with_retry(
    connector: &dyn QueueConnector,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Box<dyn QueueChannel>, QueueError> {
    retry_async(policy, "Queue connect", || connector.connect(url)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::queue_memory::MemoryBroker;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts,
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_recovers_within_budget() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);

        let channel = connect_with_retry(&broker, "memory://", &fast_policy(3)).await;

        assert!(channel.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_once_budget_is_spent() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);

        let err = connect_with_retry(&broker, "memory://", &fast_policy(4))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, QueueError::Connect(_)));
        assert_eq!(broker.connect_attempts(), 4);
    }
}
