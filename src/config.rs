//! Environment-driven configuration for the API and worker binaries.

use anyhow::{Context, Result};
use std::time::Duration;

/// Default upload size ceiling (200 MiB), matching the multipart limit.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;

/// Default presigned download URL lifetime.
pub const DEFAULT_DOWNLOAD_TTL_SECS: u64 = 3600;

/// Shared configuration read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_bucket: String,
    pub download_ttl: Duration,
    pub max_upload_bytes: u64,
    pub worker_concurrency: usize,
    pub lease_timeout: Duration,
    pub job_max_attempts: u32,
    pub api_bind: String,
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// Redis and bucket settings have local-development defaults; S3
    /// credentials are required so a misconfigured deployment fails at
    /// startup instead of on the first upload.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1/"),
            s3_endpoint: std::env::var("S3_ENDPOINT").ok(),
            s3_region: env_or("S3_REGION", "us-east-1"),
            s3_access_key: std::env::var("S3_ACCESS_KEY")
                .context("S3_ACCESS_KEY must be set")?,
            s3_secret_key: std::env::var("S3_SECRET_KEY")
                .context("S3_SECRET_KEY must be set")?,
            s3_bucket: env_or("S3_BUCKET", "pdfmill"),
            download_ttl: Duration::from_secs(parse_or(
                "PUBLIC_DOWNLOAD_TTL",
                DEFAULT_DOWNLOAD_TTL_SECS,
            )),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 4),
            lease_timeout: Duration::from_secs(parse_or("LEASE_TIMEOUT_SECS", 120)),
            job_max_attempts: parse_or("JOB_MAX_ATTEMPTS", 3),
            api_bind: env_or("API_BIND", "0.0.0.0:8080"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
