//! # Connections Module
//!
//! Persistent connections to external services. For the relay that is the
//! durable queue the share events travel through.
//!
//! - **`backoff`**: exponential backoff with jitter and a bounded attempt
//!   budget, shared by every connect path.
//! - **`queue`**: the broker-neutral `QueueConnector` / `QueueChannel` traits
//!   and `connect_with_retry`.
//! - **`queue_redis`**: Redis Streams backend (consumer groups, manual ack).
//! - **`queue_memory`**: in-process broker with the same semantics, used by
//!   tests and local runs.

/// Retry policy with exponential backoff and jitter.
pub mod backoff;
/// Broker-neutral queue client traits.
pub mod queue;
/// In-process queue broker.
pub mod queue_memory;
/// Redis Streams queue backend.
pub mod queue_redis;

pub use backoff::{retry_async, RetryPolicy};
pub use queue::{connect_with_retry, Delivery, QueueChannel, QueueConnector, QueueError};
pub use queue_memory::{MemoryBroker, QueueStats};
pub use queue_redis::RedisStreamConnector;
