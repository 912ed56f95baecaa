//! Edge agent binary.
//!
//! Runs the agent with a synthetic file-telemetry feed until SIGINT or
//! SIGTERM, then force-flushes everything and prints a stats snapshot. The
//! feed stands in for a real producer; the library's enqueue path does not
//! care where messages come from.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edgeship::agent::EdgeAgent;
use edgeship::config::Settings;
use edgeship::logging;

const FEED_TOPICS: &[&str] = &["files.txt", "files.csv", "files.json"];

/// Deterministic pseudo-random u64 per sequence number; enough variety for
/// a demo feed without pulling in an RNG.
fn scramble(seq: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seq.hash(&mut hasher);
    hasher.finish()
}

fn feed_message(seq: u64) -> (&'static str, serde_json::Value) {
    let r = scramble(seq);
    let topic = FEED_TOPICS[(r % FEED_TOPICS.len() as u64) as usize];
    let ext = topic.rsplit('.').next().unwrap_or("txt");
    let msg = json!({
        "file_type": ext,
        "path": format!("/var/data/{topic}/file_{:05}.{ext}", r % 10_000),
        "size": 512 + r % 65_536,
        "checksum": format!("{:016x}", r),
        "headers": {
            "Content-Type": "application/octet-stream",
            "X-Amzn-Trace-Id": format!("Root=1-{seq:08x}")
        }
    });
    (topic, msg)
}

async fn run_feed(agent: Arc<EdgeAgent>, cancel: CancellationToken) {
    let mut seq = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (topic, msg) = feed_message(seq);
                seq += 1;
                if let Err(e) = agent.enqueue(topic, msg).await {
                    error!(topic, error = %e, "enqueue failed");
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load configuration")?;
    logging::init(settings.log_level, settings.log_format);

    let agent = Arc::new(EdgeAgent::new(&settings));
    let cancel = CancellationToken::new();
    let sweeper = agent.spawn_sweeper(cancel.clone());
    let feed = tokio::spawn(run_feed(Arc::clone(&agent), cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();
    feed.await.context("feed task panicked")?;
    sweeper.await.context("sweeper task panicked")?;

    agent.shutdown().await;
    let stats = serde_json::to_string_pretty(&agent.stats())?;
    info!(%stats, "final agent stats");
    Ok(())
}
