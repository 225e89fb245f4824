//! # lib_common
//!
//! Building blocks for the realtime share relay. Each top-level module sits
//! behind a cargo feature of the same name so that thin tools (such as the
//! queue publisher in `cli`) only compile what they use.
//!
//! ## Modules:
//! - **`core`**: wire envelopes, the connection registry, the fan-out
//!   `Dispatcher` and the `LivenessMonitor`.
//! - **`connections`**: the durable queue client (Redis Streams or in-memory)
//!   and the retry/backoff policy used to reach it.
//! - **`ingestors`**: the queue consumer that turns deliveries into broadcasts.
//! - **`configs`**: layered relay configuration.
//! - **`loggers`**: console and rotating file logging.
//! - **`relay`**: the axum WebSocket server that composes all of the above.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "relay")]
pub mod relay;
