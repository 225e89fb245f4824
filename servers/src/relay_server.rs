//! # Relay Server
//!
//! Process entry point for the realtime share relay. Clients connect over
//! WebSocket at `/ws`; share events arrive from those clients and from the
//! durable Redis Streams queue, and every event is fanned out to every
//! connected client.
//!
//! ## Exit codes:
//! - `0`: clean shutdown after `SIGINT` / `SIGTERM`.
//! - `1`: invalid configuration, the queue was unreachable for the whole
//!   retry budget (at startup or after losing it), or the listener could not
//!   be bound.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_common::configs::load_config;
use lib_common::connections::RedisStreamConnector;
use lib_common::loggers::setup_logging;
use lib_common::relay::RelayServer;

const APP_NAME: &str = "relay_server";

/// # Main Entry Point
///
/// ## Execution Flow:
/// 1.  **Environment**: loads `.env` if present.
/// 2.  **Configuration**: defaults, config file, environment and flags.
/// 3.  **Logging**: stdout plus a rotated file in the log directory.
/// 4.  **Relay**: connects the queue, starts consuming, starts the liveness
///     monitor and accepts clients.
/// 5.  **Signals**: `CTRL+C` or `SIGTERM` start the shutdown sequence.
#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("{}: {:#}", APP_NAME, e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    // --- Phase 1: Environment ---
    // A missing .env file is the normal case in production.
    let _ = dotenvy::dotenv();

    // --- Phase 2: Configuration ---
    let (config, source) = load_config().context("loading configuration")?;

    // --- Phase 3: Logging ---
    let log_path = setup_logging(&config.log_dir, APP_NAME, &config.log_level)?;
    log::info!("{} v{} booting. Logging to {}", APP_NAME, env!("CARGO_PKG_VERSION"), log_path.display());
    log::info!("Configuration: {}", source);
    log::debug!("Effective configuration: {:?}", config);

    // --- Phase 4: Relay ---
    let connector = RedisStreamConnector::new(config.consumer_group.clone(), config.consumer_name.clone());
    let handle = RelayServer::start(&config, Arc::new(connector))
        .await
        .context("starting relay")?;

    // --- Phase 5: Signal Handling ---
    let shutdown = handle.shutdown_token();
    tokio::spawn(watch_signals(shutdown));

    handle.wait().await.context("relay stopped after losing the queue")?;
    log::info!("{} exited cleanly.", APP_NAME);
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown_signal() => {
            log::warn!("Shutdown signal received. Closing relay gracefully...");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// # Graceful Shutdown Signal Handler
///
/// Resolves on `CTRL+C` or, on UNIX, `SIGTERM`. A handler that cannot be
/// installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
