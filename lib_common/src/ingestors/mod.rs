//! # Data Ingestors Module
//!
//! Sources that feed the relay's fan-out from outside the socket layer.
//!
//! ## Contained Modules:
//! - **`queue_ingestor`**: consumes the durable share queue, wraps each message
//!   as a `realtime` frame, broadcasts it and settles the delivery.

/// Consumer loop for the durable share queue.
pub mod queue_ingestor;

// --- Public API Re-exports ---
pub use queue_ingestor::{DeliveryOutcome, IngestorExit, QueueIngestor, StopReason};
