//! # Connection Registry
//!
//! The single owner of every live `ClientConnection`.
//!
//! The accept path adds, the socket task and the liveness monitor remove, and
//! the dispatcher iterates, all concurrently. Structural changes take a short
//! `std::sync::Mutex`; iteration never holds that lock. Instead callers get a
//! `snapshot()` (a cloned `Vec` of `Arc`s), so a connection removed halfway
//! through a broadcast is simply a stale handle whose sends fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Process-unique identifier of an accepted connection.
pub type ConnectionId = u64;

/// A frame queued for delivery to one client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A text frame. Shared between all recipients of one broadcast.
    Text(Arc<str>),
    /// A liveness probe. The socket task turns it into a WebSocket ping.
    Ping,
}

/// # Client Connection
///
/// The registry's view of one accepted socket. The socket itself is owned by
/// its connection task; this handle only holds the sending half of that
/// task's outbound queue, the liveness flag and a termination token.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    /// Set on accept and on every pong, cleared by each liveness sweep.
    alive: AtomicBool,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    terminate: CancellationToken,
}

impl ClientConnection {
    /// Creates a connection handle together with the receiver its socket task
    /// drains. The connection starts out alive.
    pub fn new(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            alive: AtomicBool::new(true),
            sender,
            terminate: CancellationToken::new(),
        });
        (connection, receiver)
    }

    /// The connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// `true` while the socket task is still draining frames and the
    /// connection has not been terminated.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.terminate.is_cancelled()
    }

    /// Queues a frame. Returns `false` when the connection is not open.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.is_open() && self.sender.send(frame).is_ok()
    }

    /// Records a pong.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Whether a pong (or the accept) happened since the last sweep.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Reads and clears the liveness flag in one step.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Asks the socket task to drop the socket without a close handshake.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Token cancelled by `terminate`. The socket task selects on it.
    pub fn termination_token(&self) -> CancellationToken {
        self.terminate.clone()
    }
}

/// # Connection Registry
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, Arc<ClientConnection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next connection identifier. Identifiers start at 1.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ClientConnection>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a connection and returns the new registry size.
    pub fn add(&self, connection: Arc<ClientConnection>) -> usize {
        let mut entries = self.entries();
        entries.insert(connection.id(), connection);
        entries.len()
    }

    /// Deregisters a connection. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.entries().remove(&id)
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// A point-in-time copy of the registered connections.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.entries().values().cloned().collect()
    }

    /// Runs `f` over a snapshot. `f` may freely call back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ClientConnection>),
    {
        for connection in self.snapshot() {
            f(&connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &ConnectionRegistry) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (connection, rx) = ClientConnection::new(registry.next_connection_id());
        registry.add(Arc::clone(&connection));
        (connection, rx)
    }

    #[test]
    fn add_and_remove_track_size() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = register(&registry);
        let (b, _rx_b) = register(&registry);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
        assert!(!registry.contains(a.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_during_iteration_is_safe() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..4).map(|_| register(&registry)).collect();

        let mut visited = 0;
        registry.for_each(|connection| {
            visited += 1;
            // Remove everything, including entries not yet visited.
            for (other, _) in &handles {
                registry.remove(other.id());
            }
            let _ = connection.send(OutboundFrame::Ping);
        });

        assert_eq!(visited, 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn connection_closes_when_receiver_is_dropped() {
        let (connection, rx) = ClientConnection::new(1);
        assert!(connection.is_open());
        assert!(connection.send(OutboundFrame::Ping));
        drop(rx);
        assert!(!connection.is_open());
        assert!(!connection.send(OutboundFrame::Ping));
    }

    #[test]
    fn terminated_connection_refuses_frames() {
        let (connection, mut rx) = ClientConnection::new(1);
        connection.terminate();
        assert!(!connection.send(OutboundFrame::Text(Arc::from("x"))));
        assert!(rx.try_recv().is_err());
        assert!(connection.termination_token().is_cancelled());
    }

    #[test]
    fn liveness_flag_is_read_and_cleared() {
        let (connection, _rx) = ClientConnection::new(1);
        assert!(connection.take_alive());
        assert!(!connection.is_alive());
        assert!(!connection.take_alive());
        connection.mark_alive();
        assert!(connection.is_alive());
    }

    #[test]
    fn concurrent_mutation_and_iteration() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut threads = Vec::new();

        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            threads.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let (connection, rx) = ClientConnection::new(registry.next_connection_id());
                    registry.add(Arc::clone(&connection));
                    registry.for_each(|c| {
                        let _ = c.send(OutboundFrame::Ping);
                    });
                    drop(rx);
                    registry.remove(connection.id());
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
