//! # Fan-out Dispatcher
//!
//! Delivers one text frame to every connection in the registry.
//!
//! ## Delivery rules:
//!
//! 1.  **Zero-copy fan-out**: the frame is wrapped in an `Arc<str>` once and
//!     every connection receives a clone of the pointer.
//! 2.  **Best effort per connection**: a connection that is closed or whose
//!     queue is gone is skipped and deregistered. Nothing is retried and the
//!     remaining connections are unaffected.
//! 3.  **Total order**: broadcasts are serialized, so every connection sees
//!     the frames of concurrent broadcasts in the same order.

use std::sync::{Arc, Mutex, PoisonError};

use crate::core::registry::{ConnectionRegistry, OutboundFrame};

/// Outcome of a single broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued on.
    pub delivered: usize,
    /// Connections found closed and deregistered.
    pub skipped: usize,
}

/// # Core Dispatcher
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    order: Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            order: Mutex::new(()),
        }
    }

    /// The registry this dispatcher fans out to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// # Broadcast
    ///
    /// Queues `message` on every open connection of a registry snapshot.
    /// Never blocks on a slow client: per-connection queues are unbounded and
    /// drained by each connection's own task.
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let frame: Arc<str> = Arc::from(message);
        let mut report = BroadcastReport::default();

        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        for connection in self.registry.snapshot() {
            if connection.send(OutboundFrame::Text(Arc::clone(&frame))) {
                report.delivered += 1;
            } else {
                report.skipped += 1;
                self.registry.remove(connection.id());
                log::debug!("Client {} is not open. Removed from registry.", connection.id());
            }
        }

        log::trace!(
            "Broadcast {} bytes: {} delivered, {} skipped",
            message.len(),
            report.delivered,
            report.skipped
        );
        report
    }
}
