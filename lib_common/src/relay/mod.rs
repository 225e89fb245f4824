//! # Relay Module
//!
//! Wires the core components into a running relay.
//!
//! - **`state`**: the shared handles every request handler sees.
//! - **`downstream`**: the axum router, `/ws` client sessions and `/health`.
//! - **`upstream`**: queue connection setup and the consumer supervisor that
//!   reconnects after a lost channel.
//! - **`server`**: `RelayServer::start` and the `RelayHandle` used to observe
//!   and stop a running relay.

/// HTTP and WebSocket surface.
pub mod downstream;
/// `RelayServer` startup and shutdown.
pub mod server;
/// Shared request-handler state.
pub mod state;
/// Queue side of the relay.
pub mod upstream;

pub use server::{RelayHandle, RelayServer, StartupError};
pub use state::RelayState;
pub use upstream::{open_channel, UpstreamSupervisor};
