//! Conversion Worker Service
//!
//! Leases conversion jobs from the Redis queue and executes them via the
//! external toolchain (Ghostscript, LibreOffice, ImageMagick, Tesseract).
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `S3_ENDPOINT`/`S3_REGION`/`S3_ACCESS_KEY`/`S3_SECRET_KEY`/`S3_BUCKET`
//! - `WORKER_CONCURRENCY`: Number of concurrent workers (default: 4)
//! - `LEASE_TIMEOUT_SECS`: Lease expiry before re-queue (default: 120)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use pdfmill::config::Config;
use pdfmill::convert::{Convert, ToolConverter};
use pdfmill::queue::JobQueue;
use pdfmill::store::{ObjectStore, S3ObjectStore};
use pdfmill::{telemetry, worker};
use redis::Client;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting conversion worker service");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration: redis_url={}, concurrency={}, lease_timeout={:?}",
        config.redis_url, config.worker_concurrency, config.lease_timeout
    );

    let client = Client::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::from_config(&config));
    let converter: Arc<dyn Convert> = Arc::new(ToolConverter::new());

    let mut handles = vec![];
    for worker_id in 0..config.worker_concurrency {
        let queue = JobQueue::new(conn.clone(), config.lease_timeout);
        let semaphore = semaphore.clone();
        let store = store.clone();
        let converter = converter.clone();

        let handle = tokio::spawn(async move {
            worker::worker_loop(worker_id, queue, semaphore, store, converter).await
        });

        handles.push(handle);
    }

    // One reclaim task per process is enough; the zset removal makes
    // concurrent reclaimers across processes safe anyway.
    let reclaim_queue = JobQueue::new(conn.clone(), config.lease_timeout);
    let reclaim_interval = config.lease_timeout / 2;
    handles.push(tokio::spawn(async move {
        worker::reclaim_loop(reclaim_queue, reclaim_interval).await
    }));

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    // Stop the lease and reclaim loops first so no new job is taken,
    // then wait for the pool to drain: in-flight jobs hold semaphore
    // permits until their results are reported.
    info!("Received shutdown signal, draining in-flight jobs...");
    for handle in handles {
        handle.abort();
        let _ = handle.await;
    }
    worker::wait_for_idle(semaphore.clone(), config.worker_concurrency).await;

    info!("Worker service shutdown complete");
    Ok(())
}
