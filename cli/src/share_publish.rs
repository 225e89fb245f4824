//! # `share_publish`: Share Event Publisher
//!
//! Publishes one `share_item` event onto the relay's durable queue, the same
//! way the item API does for producers that cannot hold a live WebSocket
//! connection. Every relay consuming the queue forwards it to its clients as
//! a `realtime` frame.
//!
//! ## Usage
//!
//! ```bash
//! share_publish --id 42 --title "Launch notes" --url https://example.org/notes
//! share_publish --raw 'anything, JSON or not'
//! ```
//!
//! The queue URL and name come from `--queue-url` / `--queue-name` or the
//! `QUEUE_URL` / `QUEUE_NAME` environment variables, as for the relay.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use lib_common::connections::{connect_with_retry, RedisStreamConnector, RetryPolicy};
use lib_common::core::{ShareEnvelope, SharedItem};

/// # Command Line Arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Publishes a share_item event onto the relay's durable queue")]
struct Args {
    /// Queue broker URL.
    #[arg(long, env = "QUEUE_URL", default_value = "redis://127.0.0.1:6379/")]
    queue_url: String,

    /// Name of the durable share queue.
    #[arg(long, env = "QUEUE_NAME", default_value = "shared_items")]
    queue_name: String,

    /// Consumer group the relays read with. Created if missing so that the
    /// event is kept until a relay starts.
    #[arg(long, env = "QUEUE_CONSUMER_GROUP", default_value = "relay")]
    consumer_group: String,

    /// Item identifier.
    #[arg(long, required_unless_present = "raw")]
    id: Option<i64>,

    /// Item title.
    #[arg(long)]
    title: Option<String>,

    /// Item description.
    #[arg(long)]
    description: Option<String>,

    /// Item link or inline image reference.
    #[arg(long)]
    url: Option<String>,

    /// Publish this text verbatim instead of building an envelope.
    #[arg(long, conflicts_with_all = ["id", "title", "description", "url"])]
    raw: Option<String>,

    /// Connect attempts before giving up.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
}

/// Builds the message body described by `args`.
fn build_payload(args: &Args) -> Result<String> {
    if let Some(raw) = &args.raw {
        return Ok(raw.clone());
    }
    let Some(id) = args.id else {
        bail!("either --id or --raw is required");
    };

    let mut item = SharedItem::new(id);
    item.title = args.title.clone();
    item.description = args.description.clone();
    item.url = args.url.clone();

    ShareEnvelope::share(item).to_json().context("encoding the share envelope")
}

async fn publish(args: &Args, payload: &str) -> Result<()> {
    let policy = RetryPolicy {
        max_attempts: args.max_retries,
        initial_delay: Duration::from_millis(500),
        ..RetryPolicy::default()
    };
    let connector = RedisStreamConnector::new(args.consumer_group.clone(), "share_publish");

    let mut channel = connect_with_retry(&connector, &args.queue_url, &policy)
        .await
        .with_context(|| format!("connecting to {}", args.queue_url))?;
    channel
        .assert_queue(&args.queue_name)
        .await
        .with_context(|| format!("declaring queue {}", args.queue_name))?;
    channel
        .publish(&args.queue_name, payload.as_bytes())
        .await
        .with_context(|| format!("publishing to {}", args.queue_name))?;

    if let Err(e) = channel.close().await {
        log::warn!("Closing queue channel failed: {}", e);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let result = match build_payload(&args) {
        Ok(payload) => publish(&args, &payload).await.map(|()| payload),
        Err(e) => Err(e),
    };

    match result {
        Ok(payload) => {
            log::info!("Published to {}: {}", args.queue_name, payload);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
