//! # Core Relay Module
//!
//! The in-process half of the relay: everything that happens between a frame
//! arriving (from a peer socket or from the queue) and that frame being pushed
//! onto every live client connection.
//!
//! ## Core Components:
//!
//! - **`envelope`**: the wire types (`ShareEnvelope`, `SharedItem`) and the
//!   `{ source, payload }` wrapping applied to queue-origin traffic.
//! - **`registry`**: the synchronized set of live `ClientConnection`s. All
//!   iteration happens over snapshots so concurrent disconnects are harmless.
//! - **`dispatcher`**: best-effort fan-out of one text frame to every
//!   connection in a registry snapshot.
//! - **`liveness`**: the ping/pong sweep that evicts silent connections.
//! - **`error`**: `RelayError`, the processing failures of this layer.

/// Wire envelopes and queue-origin wrapping.
pub mod envelope;
/// Processing errors raised while relaying frames.
pub mod error;
/// The synchronized set of live client connections.
pub mod registry;
/// Best-effort fan-out of text frames.
pub mod dispatcher;
/// Periodic ping/pong liveness sweeps.
pub mod liveness;

// --- Public API Re-exports ---
pub use dispatcher::{BroadcastReport, Dispatcher};
pub use envelope::{
    validate_peer_message, wrap_queue_payload, ItemId, ShareAction, ShareEnvelope, SharedItem,
};
pub use error::RelayError;
pub use liveness::{LivenessMonitor, SweepReport};
pub use registry::{ClientConnection, ConnectionId, ConnectionRegistry, OutboundFrame};
