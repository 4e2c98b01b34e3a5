use anyhow::{Context, Result};
use carepath_worker::{telemetry, SyncWorker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real deployments set the environment directly
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG: Full filter directive
    // - LOG_LEVEL: Worker log level (default: "debug")
    telemetry::init_tracing();

    tracing::info!("carepath-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        worker_id = %config.worker_id,
        tenant_id = %config.tenant_id,
        sync_interval_secs = config.sync_interval.as_secs(),
        lease_secs = config.lease_ttl.as_secs(),
        "Starting sync worker"
    );

    let worker = SyncWorker::new(config)
        .await
        .context("Failed to create sync worker")?;

    // Run the worker (blocks until shutdown)
    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            worker.shutdown();
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
