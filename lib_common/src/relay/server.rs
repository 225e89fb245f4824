//! # Relay Server
//!
//! Startup and shutdown of a complete relay.
//!
//! ## Startup sequence:
//!
//! 1.  Connect to the queue and assert it durable, retrying with backoff. An
//!     exhausted retry budget fails startup.
//! 2.  Bind the client listener.
//! 3.  Start consuming the queue.
//! 4.  Start the liveness monitor.
//! 5.  Start accepting clients, then log readiness.
//!
//! ## Shutdown sequence:
//!
//! Cancelling the shutdown token stops the consumer (which closes the queue
//! channel), stops the liveness monitor and closes every client session.
//! The HTTP server is then stopped with a bounded wait. Every step is best
//! effort: failures are logged and shutdown moves on.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::relay_config::RelayConfig;
use crate::connections::queue::{QueueConnector, QueueError};
use crate::core::liveness::LivenessMonitor;
use crate::core::registry::ConnectionRegistry;
use crate::relay::downstream;
use crate::relay::state::RelayState;
use crate::relay::upstream::{open_channel, UpstreamSupervisor};

/// How long shutdown waits for the HTTP server to drain.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons the relay could not start.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The queue stayed unreachable for the whole retry budget.
    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),

    /// The client listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// # Relay Server
pub struct RelayServer;

impl RelayServer {
    /// # Start
    ///
    /// Runs the startup sequence and returns once the relay is ready.
    ///
    /// # Errors
    /// `StartupError::Queue` when the queue connect budget is exhausted,
    /// `StartupError::Bind` when the listener cannot be bound. Nothing is left
    /// running in either case.
    pub async fn start(config: &RelayConfig, connector: Arc<dyn QueueConnector>) -> Result<RelayHandle, StartupError> {
        log::info!(
            "Starting relay: queue {} at {}, clients on {}:{}",
            config.queue_name,
            config.queue_url,
            config.host,
            config.port
        );

        // --- Phase 1: Queue Connection ---
        let policy = config.retry_policy();
        let channel = open_channel(connector.as_ref(), &config.queue_url, &config.queue_name, &policy).await?;

        // --- Phase 2: Listener ---
        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let mut channel = channel;
                let _ = channel.close().await;
                return Err(StartupError::Bind { addr: bind_addr, source });
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;

        let shutdown = CancellationToken::new();
        let state = RelayState::new(shutdown.clone());

        // --- Phase 3: Queue Consumer ---
        let supervisor = UpstreamSupervisor::new(
            connector,
            config.queue_url.clone(),
            config.queue_name.clone(),
            policy,
            Arc::clone(&state.dispatcher),
        )
        .with_dead_letter_queue(config.dead_letter_queue.clone());
        let upstream = tokio::spawn(supervisor.run(channel, shutdown.clone()));

        // --- Phase 4: Liveness Monitor ---
        let monitor = LivenessMonitor::new(Arc::clone(&state.registry), config.heartbeat_interval);
        let monitor = tokio::spawn(monitor.run(shutdown.clone()));

        // --- Phase 5: Accept Clients ---
        let server_stop = CancellationToken::new();
        let app = downstream::router(state.clone());
        let stop_signal = server_stop.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop_signal.cancelled().await })
                .await
        });

        log::info!(
            "Relay ready. Consuming {}, accepting clients on ws://{}/ws",
            config.queue_name,
            local_addr
        );

        Ok(RelayHandle {
            local_addr,
            state,
            server_stop,
            upstream,
            monitor,
            server,
        })
    }
}

/// # Relay Handle
///
/// A running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: RelayState,
    server_stop: CancellationToken,
    upstream: JoinHandle<Result<(), QueueError>>,
    monitor: JoinHandle<()>,
    server: JoinHandle<io::Result<()>>,
}

impl RelayHandle {
    /// The address the client listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.state.registry.len()
    }

    /// The token that starts shutdown when cancelled. Signal handlers hold a
    /// clone of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Starts shutdown and waits for it to finish.
    ///
    /// # Errors
    /// See `wait`.
    pub async fn shutdown(self) -> Result<(), QueueError> {
        self.state.shutdown.cancel();
        self.wait().await
    }

    /// # Wait
    ///
    /// Waits until shutdown is requested, then runs the shutdown sequence.
    ///
    /// # Errors
    /// The queue error that forced the shutdown, if the relay stopped
    /// because the queue could not be reconnected.
    pub async fn wait(mut self) -> Result<(), QueueError> {
        self.state.shutdown.cancelled().await;
        log::info!("Relay shutting down.");

        // --- Phase 1: Queue Consumer ---
        let outcome = match (&mut self.upstream).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Queue consumer task failed: {}", e);
                Ok(())
            }
        };

        // --- Phase 2: Liveness Monitor ---
        if let Err(e) = (&mut self.monitor).await {
            log::warn!("Liveness monitor task failed: {}", e);
        }

        // --- Phase 3: HTTP Server ---
        self.server_stop.cancel();
        match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut self.server).await {
            Ok(Ok(Ok(()))) => log::info!("Client listener closed."),
            Ok(Ok(Err(e))) => log::warn!("Client listener failed: {}", e),
            Ok(Err(e)) => log::warn!("Client listener task failed: {}", e),
            Err(_) => {
                log::warn!(
                    "Client listener did not stop within {}s. Aborting it.",
                    SERVER_DRAIN_TIMEOUT.as_secs()
                );
                self.server.abort();
            }
        }

        log::info!("Relay stopped.");
        outcome
    }
}
