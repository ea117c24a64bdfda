//! Submission API Service
//!
//! Accepts multipart uploads, stores inputs, enqueues conversion jobs,
//! and serves job polling and presigned download URLs.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `S3_ENDPOINT`/`S3_REGION`/`S3_ACCESS_KEY`/`S3_SECRET_KEY`/`S3_BUCKET`
//! - `MAX_UPLOAD_BYTES`: Per-file upload ceiling (default: 200 MiB)
//! - `PUBLIC_DOWNLOAD_TTL`: Presigned URL lifetime in seconds (default: 3600)
//! - `API_BIND`: Listen address (default: 0.0.0.0:8080)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use pdfmill::api::{self, AppState};
use pdfmill::config::Config;
use pdfmill::queue::JobQueue;
use pdfmill::store::S3ObjectStore;
use redis::Client;
use std::sync::Arc;
use tracing::info;
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

    info!("Starting submission API service");

    let config = Config::from_env().context("Failed to load configuration")?;

    let client = Client::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let state = Arc::new(AppState {
        queue: JobQueue::new(conn, config.lease_timeout),
        store: Arc::new(S3ObjectStore::from_config(&config)),
        config: config.clone(),
    });

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.api_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.api_bind))?;

    info!("API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .await
        .context("API server exited")?;
    Ok(())
}
