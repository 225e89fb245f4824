//! # Liveness Monitor
//!
//! Evicts connections that stop answering pings.
//!
//! Each connection cycles through:
//!
//! ```text
//! ALIVE --(sweep: flag cleared, ping queued)--> AWAITING_PONG
//! AWAITING_PONG --(pong: flag set)--> ALIVE
//! AWAITING_PONG --(sweep, flag still clear)--> TERMINATED (removed)
//! ```
//!
//! A connection that never answers is therefore evicted on the second sweep
//! after it was accepted, and no registered connection has been silent for
//! more than two intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::registry::{ConnectionRegistry, OutboundFrame};

/// What a single sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that were alive and have been pinged again.
    pub pinged: usize,
    /// Connections terminated and removed.
    pub evicted: usize,
}

/// # Liveness Monitor
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl LivenessMonitor {
    /// Creates a monitor that sweeps `registry` every `interval`.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// The sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Performs one sweep over a registry snapshot.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for connection in self.registry.snapshot() {
            if !connection.take_alive() {
                log::info!("Client {} missed its pong. Terminating.", connection.id());
                connection.terminate();
                self.registry.remove(connection.id());
                report.evicted += 1;
            } else if connection.send(OutboundFrame::Ping) {
                report.pinged += 1;
            } else {
                // Socket task already gone; nothing left to probe.
                self.registry.remove(connection.id());
                report.evicted += 1;
            }
        }

        if report.evicted > 0 {
            log::info!(
                "Liveness sweep evicted {} connection(s), {} remain",
                report.evicted,
                self.registry.len()
            );
        }
        report
    }

    /// Sweeps on a fixed interval until `shutdown` is cancelled. The first
    /// sweep happens one full interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Liveness monitor stopped.");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }
}
