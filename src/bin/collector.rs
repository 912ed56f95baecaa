//! Collector binary: bind, accept until SIGINT/SIGTERM, report stats.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use edgeship::collector::CollectorServer;
use edgeship::config::Settings;
use edgeship::logging;

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

    let server = Arc::new(CollectorServer::new(&settings).context("collector setup failed")?);
    let listener = CollectorServer::bind(&settings).await?;

    let cancel = CancellationToken::new();
    let accept_loop = tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();
    accept_loop.await.context("accept loop panicked")?;

    let stats = serde_json::to_string_pretty(&server.stats())?;
    info!(%stats, "final collector stats");
    Ok(())
}
