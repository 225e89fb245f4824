//! # Relay Server Configuration
//!
//! Settings are resolved in three layers, later layers overriding earlier
//! ones field by field:
//!
//! 1. Built-in defaults.
//! 2. A JSON file (`relay_server.conf`, or `--config-path` / `RELAY_CONFIG_PATH`).
//!    A missing file is not an error.
//! 3. Environment variables and command-line flags (clap reads both).
//!
//! The merged `RelayConfigArgs` is then validated into a `RelayConfig` with
//! concrete types.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "relay_server.conf";

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has a value the relay cannot run with.
    #[error("invalid value for {setting}: {reason}")]
    Invalid {
        /// The offending setting.
        setting: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Where the file layer of a resolved configuration came from.
///
/// Returned next to the config so that the caller can log it once logging is
/// set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Settings were read from this file.
    File(PathBuf),
    /// Nothing exists at this path. Defaults, environment and flags only.
    NoFile(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "config file {}", path.display()),
            ConfigSource::NoFile(path) => write!(
                f,
                "no config file at {}, using defaults and environment/CLI variables",
                path.display()
            ),
        }
    }
}

/// # Relay Config Layer
///
/// One configuration layer. Every field is optional so that layers can be
/// merged; `None` means "not set here".
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[command(about = "Realtime share relay: fans queue and peer share events out to WebSocket clients", version)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfigArgs {
    /// Path to the JSON configuration file.
    #[arg(long, env = "RELAY_CONFIG_PATH")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// Queue broker URL.
    #[arg(long, env = "QUEUE_URL")]
    pub queue_url: Option<String>,

    /// Name of the durable share queue.
    #[arg(long, env = "QUEUE_NAME")]
    pub queue_name: Option<String>,

    /// Address to bind the client listener to.
    #[arg(long, env = "WS_HOST")]
    pub host: Option<String>,

    /// Port to listen on for client connections. 0 picks a free port.
    #[arg(long, env = "WS_PORT")]
    pub port: Option<u16>,

    /// Maximum queue connect attempts before giving up.
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Wait in milliseconds after the first failed connect attempt.
    #[arg(long, env = "RETRY_DELAY_MS")]
    pub retry_delay_ms: Option<u64>,

    /// Ceiling in milliseconds for the exponential connect backoff.
    #[arg(long, env = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: Option<u64>,

    /// Upper bound in milliseconds of the random jitter added to each wait.
    #[arg(long, env = "RETRY_JITTER_MS")]
    pub retry_jitter_ms: Option<u64>,

    /// Seconds between liveness sweeps.
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Consumer group the relay joins.
    #[arg(long, env = "QUEUE_CONSUMER_GROUP")]
    pub consumer_group: Option<String>,

    /// Consumer name within the group. Defaults to `relay-<host>-<pid>`.
    #[arg(long, env = "QUEUE_CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    /// Queue that receives messages the relay could not process.
    #[arg(long, env = "DEAD_LETTER_QUEUE")]
    pub dead_letter_queue: Option<String>,

    /// Directory for log files.
    #[arg(long, env = "RELAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl RelayConfigArgs {
    /// The built-in bottom layer.
    pub fn defaults() -> Self {
        Self {
            config_path: None,
            queue_url: Some("redis://127.0.0.1:6379/".to_string()),
            queue_name: Some("shared_items".to_string()),
            host: Some("0.0.0.0".to_string()),
            port: Some(8080),
            max_retries: Some(10),
            retry_delay_ms: Some(1000),
            retry_max_delay_ms: Some(30_000),
            retry_jitter_ms: Some(300),
            heartbeat_interval_secs: Some(30),
            consumer_group: Some("relay".to_string()),
            consumer_name: None,
            dead_letter_queue: None,
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
        }
    }

    /// Overlays `other` on `self`: every field set in `other` wins.
    pub fn merge(self, other: RelayConfigArgs) -> RelayConfigArgs {
        RelayConfigArgs {
            config_path: other.config_path.or(self.config_path),
            queue_url: other.queue_url.or(self.queue_url),
            queue_name: other.queue_name.or(self.queue_name),
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            max_retries: other.max_retries.or(self.max_retries),
            retry_delay_ms: other.retry_delay_ms.or(self.retry_delay_ms),
            retry_max_delay_ms: other.retry_max_delay_ms.or(self.retry_max_delay_ms),
            retry_jitter_ms: other.retry_jitter_ms.or(self.retry_jitter_ms),
            heartbeat_interval_secs: other.heartbeat_interval_secs.or(self.heartbeat_interval_secs),
            consumer_group: other.consumer_group.or(self.consumer_group),
            consumer_name: other.consumer_name.or(self.consumer_name),
            dead_letter_queue: other.dead_letter_queue.or(self.dead_letter_queue),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }
}

/// # Relay Config
///
/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Queue broker URL.
    pub queue_url: String,
    /// Durable queue consumed by the relay.
    pub queue_name: String,
    /// Listener bind address.
    pub host: String,
    /// Listener port. `0` lets the OS pick.
    pub port: u16,
    /// Queue connect attempt budget.
    pub max_retries: u32,
    /// Wait after the first failed connect attempt.
    pub retry_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Jitter bound added to each backoff wait.
    pub retry_jitter: Duration,
    /// Liveness sweep interval.
    pub heartbeat_interval: Duration,
    /// Consumer group.
    pub consumer_group: String,
    /// Consumer name within the group.
    pub consumer_name: String,
    /// Where unprocessable messages are copied, if anywhere.
    pub dead_letter_queue: Option<String>,
    /// Log file directory.
    pub log_dir: PathBuf,
    /// Log level name.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_url: "redis://127.0.0.1:6379/".to_string(),
            queue_name: "shared_items".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_jitter: Duration::from_millis(300),
            heartbeat_interval: Duration::from_secs(30),
            consumer_group: "relay".to_string(),
            consumer_name: default_consumer_name(),
            dead_letter_queue: None,
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
        }
    }
}

impl TryFrom<RelayConfigArgs> for RelayConfig {
    type Error = ConfigError;

    fn try_from(args: RelayConfigArgs) -> Result<Self, Self::Error> {
        let args = RelayConfigArgs::defaults().merge(args);

        let queue_url = non_empty(args.queue_url, "queue_url")?;
        let queue_name = non_empty(args.queue_name, "queue_name")?;
        let consumer_group = non_empty(args.consumer_group, "consumer_group")?;
        let host = non_empty(args.host, "host")?;

        let heartbeat_secs = args.heartbeat_interval_secs.unwrap_or(30);
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                setting: "heartbeat_interval_secs",
                reason: "must be greater than zero",
            });
        }

        let retry_delay = Duration::from_millis(args.retry_delay_ms.unwrap_or(1000));
        let retry_max_delay = Duration::from_millis(args.retry_max_delay_ms.unwrap_or(30_000));
        if retry_max_delay < retry_delay {
            return Err(ConfigError::Invalid {
                setting: "retry_max_delay_ms",
                reason: "must not be smaller than retry_delay_ms",
            });
        }

        let consumer_name = match args.consumer_name.filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => default_consumer_name(),
        };

        Ok(RelayConfig {
            queue_url,
            queue_name,
            host,
            port: args.port.unwrap_or(8080),
            max_retries: args.max_retries.unwrap_or(10),
            retry_delay,
            retry_max_delay,
            retry_jitter: Duration::from_millis(args.retry_jitter_ms.unwrap_or(300)),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            consumer_group,
            consumer_name,
            dead_letter_queue: args.dead_letter_queue.filter(|queue| !queue.trim().is_empty()),
            log_dir: args.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: args.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

#[cfg(feature = "connections")]
impl RelayConfig {
    /// The queue connect retry policy these settings describe.
    pub fn retry_policy(&self) -> crate::connections::backoff::RetryPolicy {
        crate::connections::backoff::RetryPolicy {
            initial_delay: self.retry_delay,
            max_delay: self.retry_max_delay,
            max_attempts: self.max_retries,
            max_jitter: self.retry_jitter,
        }
    }
}

fn non_empty(value: Option<String>, setting: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Invalid {
            setting,
            reason: "must not be empty",
        }),
    }
}

fn default_consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("relay-{}-{}", host, std::process::id())
}

/// Reads the file layer. `Ok(None)` when the file does not exist.
fn read_config_file(path: &Path) -> Result<Option<RelayConfigArgs>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file_args = serde_json::from_str::<RelayConfigArgs>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(file_args))
}

/// # Load Config From Layers
///
/// Resolves defaults, the config file named by `cli` (or the default file)
/// and `cli` itself. Also reports whether the file layer was found.
///
/// # Errors
/// An unreadable or malformed config file, or an invalid merged value.
pub fn load_config_from(cli: RelayConfigArgs) -> Result<(RelayConfig, ConfigSource), ConfigError> {
    // --- Phase 1: Defaults ---
    let mut layered = RelayConfigArgs::defaults();

    // --- Phase 2: Config File ---
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let source = match read_config_file(&path)? {
        Some(file_args) => {
            layered = layered.merge(file_args);
            ConfigSource::File(path)
        }
        None => ConfigSource::NoFile(path),
    };

    // --- Phase 3: Environment & CLI ---
    layered = layered.merge(cli);

    Ok((RelayConfig::try_from(layered)?, source))
}

/// Parses the process arguments and environment, then calls
/// `load_config_from`. Exits with a usage message on bad flags.
///
/// # Errors
/// See `load_config_from`.
pub fn load_config() -> Result<(RelayConfig, ConfigSource), ConfigError> {
    load_config_from(RelayConfigArgs::parse())
}
