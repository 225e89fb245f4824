//! # Configuration Modules
//!
//! Layered runtime configuration for the relay: built-in defaults, then an
//! optional JSON file, then environment variables and command-line flags.

/// Relay server settings and their loader.
pub mod relay_config;

pub use relay_config::{load_config, load_config_from, ConfigError, ConfigSource, RelayConfig, RelayConfigArgs};
