//! # Queue Ingestor
//!
//! Pulls share events off the durable queue and fans them out to every
//! connected client.
//!
//! For each delivery:
//!
//! 1. The payload is wrapped as `{"source":"realtime","payload":...}` (anything
//!    that is not JSON becomes `{"raw":...}`).
//! 2. The frame is broadcast.
//! 3. The delivery is acknowledged.
//!
//! If wrapping fails the delivery is negatively acknowledged without requeue,
//! after an optional copy to a dead-letter queue. Every delivery is settled
//! exactly once before the next one is fetched.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connections::queue::{Delivery, QueueChannel, QueueError};
use crate::core::dispatcher::Dispatcher;
use crate::core::envelope::wrap_queue_payload;
use crate::core::error::RelayError;

/// Turns a queue payload into the frame that is broadcast.
type FrameBuilder = fn(&[u8]) -> Result<String, RelayError>;

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Broadcast to this many clients, then acknowledged.
    Acked {
        /// Clients the frame was queued on.
        delivered: usize,
    },
    /// Negatively acknowledged without requeue.
    Rejected {
        /// Whether a copy landed on the dead-letter queue first.
        dead_lettered: bool,
    },
}

/// Why the consumer loop stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The channel failed and cannot be used any more.
    ChannelLost(QueueError),
}

/// Returned by `QueueIngestor::run`. Hands the channel back so the caller can
/// close it (or drop it after a failure).
pub struct IngestorExit {
    /// The channel the ingestor consumed from.
    pub channel: Box<dyn QueueChannel>,
    /// Why the loop ended.
    pub reason: StopReason,
}

impl fmt::Debug for IngestorExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestorExit").field("reason", &self.reason).finish_non_exhaustive()
    }
}

/// # Queue Ingestor
pub struct QueueIngestor {
    channel: Box<dyn QueueChannel>,
    dispatcher: Arc<Dispatcher>,
    dead_letter_queue: Option<String>,
    build_frame: FrameBuilder,
}

impl QueueIngestor {
    /// Creates an ingestor on a channel whose queue is already asserted.
    pub fn new(channel: Box<dyn QueueChannel>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            channel,
            dispatcher,
            dead_letter_queue: None,
            build_frame: wrap_queue_payload,
        }
    }

    /// Copies rejected messages to `queue` before discarding them.
    pub fn with_dead_letter_queue(mut self, queue: Option<String>) -> Self {
        self.dead_letter_queue = queue;
        self
    }

    /// # Handle One Delivery
    ///
    /// Applies the wrap, broadcast, settle sequence.
    ///
    /// # Errors
    /// Only channel failures while settling. A payload that cannot be
    /// processed is not an error here: it is rejected and reported as
    /// `DeliveryOutcome::Rejected`.
    pub async fn handle_delivery(&mut self, delivery: Delivery) -> Result<DeliveryOutcome, QueueError> {
        if delivery.redelivered {
            log::debug!("Processing redelivered message {}", delivery.tag);
        }

        match (self.build_frame)(&delivery.payload) {
            Ok(frame) => {
                let report = self.dispatcher.broadcast(&frame);
                self.channel.ack(delivery).await?;
                Ok(DeliveryOutcome::Acked {
                    delivered: report.delivered,
                })
            }
            Err(e) => {
                log::error!("Failed to process queue message {}: {}. Dropping it.", delivery.tag, e);

                let mut dead_lettered = false;
                if let Some(queue) = &self.dead_letter_queue {
                    match self.channel.publish(queue, &delivery.payload).await {
                        Ok(()) => dead_lettered = true,
                        Err(e) => log::warn!("Failed to dead-letter message {} to {}: {}", delivery.tag, queue, e),
                    }
                }

                self.channel.nack(delivery, false).await?;
                Ok(DeliveryOutcome::Rejected { dead_lettered })
            }
        }
    }

    /// Consumes until `shutdown` is cancelled or the channel fails.
    pub async fn run(mut self, shutdown: CancellationToken) -> IngestorExit {
        log::info!("Queue ingestor started.");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = self.channel.next_delivery() => Some(next),
            };

            let result = match next {
                None => return self.exit(StopReason::Shutdown),
                Some(Ok(None)) => continue,
                Some(Ok(Some(delivery))) => self.handle_delivery(delivery).await.map(|_| ()),
                Some(Err(e)) => Err(e),
            };

            if let Err(e) = result {
                log::error!("Queue channel lost: {}", e);
                return self.exit(StopReason::ChannelLost(e));
            }
        }
    }

    fn exit(self, reason: StopReason) -> IngestorExit {
        log::info!("Queue ingestor stopped: {:?}", reason);
        IngestorExit {
            channel: self.channel,
            reason,
        }
    }
}
