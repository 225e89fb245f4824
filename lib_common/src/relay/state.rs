use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::core::registry::ConnectionRegistry;

/// # Relay State
///
/// Cloned into every handler. All fields are shared handles.
#[derive(Debug, Clone)]
pub struct RelayState {
    /// Live client connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Fan-out over `registry`.
    pub dispatcher: Arc<Dispatcher>,
    /// Cancelled once the relay starts shutting down.
    pub shutdown: CancellationToken,
}

impl RelayState {
    /// Fresh state with an empty registry.
    pub fn new(shutdown: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        Self {
            registry,
            dispatcher,
            shutdown,
        }
    }
}
