//! # Upstream Queue Supervisor
//!
//! Owns the queue side of the relay: opening the channel with retry and
//! keeping a `QueueIngestor` running on it until shutdown.
//!
//! A channel lost at runtime is reopened with the same retry policy as the
//! initial connect. If that budget is exhausted too, the supervisor cancels
//! the relay's shutdown token and reports the error, so the process exits
//! non-zero instead of running without a queue.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connections::backoff::{retry_async, RetryPolicy};
use crate::connections::queue::{QueueChannel, QueueConnector, QueueError};
use crate::core::dispatcher::Dispatcher;
use crate::ingestors::queue_ingestor::{QueueIngestor, StopReason};

/// # Open Channel
///
/// Connects and asserts `queue` as durable, retrying the pair per `policy`.
///
/// # Errors
/// The last failure once the attempt budget is spent.
pub async fn open_channel(
    connector: &dyn QueueConnector,
    url: &str,
    queue: &str,
    policy: &RetryPolicy,
) -> Result<Box<dyn QueueChannel>, QueueError> {
    retry_async(policy, "Queue connect", || async move {
        let mut channel = connector.connect(url).await?;
        channel.assert_queue(queue).await?;
        Ok::<_, QueueError>(channel)
    })
    .await
}

/// # Upstream Supervisor
pub struct UpstreamSupervisor {
    connector: Arc<dyn QueueConnector>,
    url: String,
    queue: String,
    policy: RetryPolicy,
    dispatcher: Arc<Dispatcher>,
    dead_letter_queue: Option<String>,
}

impl UpstreamSupervisor {
    /// Creates a supervisor that consumes `queue` at `url`.
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        url: impl Into<String>,
        queue: impl Into<String>,
        policy: RetryPolicy,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            queue: queue.into(),
            policy,
            dispatcher,
            dead_letter_queue: None,
        }
    }

    /// Sets the dead-letter queue handed to every ingestor.
    pub fn with_dead_letter_queue(mut self, queue: Option<String>) -> Self {
        self.dead_letter_queue = queue;
        self
    }

    /// Consumes from `channel` (and its replacements) until `shutdown`.
    ///
    /// On shutdown the current channel is closed; a failing close is logged
    /// and otherwise ignored.
    ///
    /// # Errors
    /// The reconnect error when a lost channel could not be reopened.
    /// `shutdown` has been cancelled by then.
    pub async fn run(self, channel: Box<dyn QueueChannel>, shutdown: CancellationToken) -> Result<(), QueueError> {
        let mut channel = channel;

        loop {
            let exit = QueueIngestor::new(channel, Arc::clone(&self.dispatcher))
                .with_dead_letter_queue(self.dead_letter_queue.clone())
                .run(shutdown.clone())
                .await;
            let mut lost = exit.channel;

            match exit.reason {
                StopReason::Shutdown => {
                    match lost.close().await {
                        Ok(()) => log::info!("Queue channel closed."),
                        Err(e) => log::warn!("Closing queue channel failed: {}", e),
                    }
                    return Ok(());
                }
                StopReason::ChannelLost(e) => {
                    log::warn!("Queue channel to {} lost: {}. Reconnecting.", self.queue, e);
                    drop(lost);
                }
            }

            let reopened = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                reopened = open_channel(self.connector.as_ref(), &self.url, &self.queue, &self.policy) => reopened,
            };

            match reopened {
                Ok(fresh) => {
                    log::info!("Queue channel to {} restored.", self.queue);
                    channel = fresh;
                }
                Err(e) => {
                    log::error!("Queue reconnect failed permanently: {}. Shutting down.", e);
                    shutdown.cancel();
                    return Err(e);
                }
            }
        }
    }
}
