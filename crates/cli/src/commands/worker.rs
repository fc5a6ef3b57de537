// Worker command: run the dispatch loop until Ctrl-C

use std::time::Duration;

use anyhow::Result;
use oncepay_durable::DurableRuntime;
use tokio::sync::watch;

/// How often finished workflows past the retention window are archived
const ARCHIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub async fn run(runtime: DurableRuntime) -> Result<()> {
    tracing::info!(
        dispatcher_concurrency = runtime.config().dispatcher_concurrency,
        activity_concurrency = runtime.config().activity_concurrency,
        retention_secs = runtime.config().retention.as_secs(),
        "oncepay worker starting..."
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut archive_shutdown = shutdown_rx.clone();
    let archiver = async {
        let mut ticker = tokio::time::interval(ARCHIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = runtime.archive_completed(runtime.config().retention).await {
                        tracing::warn!(error = %e, "archival failed");
                    }
                }
                _ = archive_shutdown.changed() => break,
            }
        }
    };

    let (dispatched, ()) = tokio::join!(runtime.run(shutdown_rx), archiver);
    dispatched?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
