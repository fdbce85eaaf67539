use std::sync::Arc;

use jobrelay_infra::Settings;
use jobrelay_worker::{Backends, WorkerRuntime, command_executor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobrelay_observability::init();

    let settings = Settings::from_env();
    tracing::info!(
        max_workers = settings.max_workers,
        backend = ?settings.backend(),
        queue = %settings.queue.name,
        "starting worker"
    );

    let backends = Backends::from_settings(&settings).await?;
    let executor = Arc::new(command_executor(&settings.executor)?);
    let runtime = WorkerRuntime::start(&backends, executor, settings.max_workers).await?;

    wait_for_signal().await;

    let health = runtime.health();
    tracing::info!(active = health.active, "shutdown requested, draining");
    let stats = runtime.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        dropped = stats.jobs_dropped,
        "worker stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
