//! Object store adapter: opaque blob put/get plus presigned downloads.
//!
//! Inputs and outputs cross component boundaries as store keys, never as
//! bytes. The API writes inputs under `in/{jobId}/...`, workers write
//! outputs under `out/{jobId}/...`, and deletion is left to the bucket's
//! lifecycle policy.

use crate::config::Config;
use crate::job::Operation;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage operations the pipeline depends on.
///
/// The API and worker only ever see this trait, so tests can substitute
/// an in-memory or mock store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches the full object bytes at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Writes `data` at `key` with the given content type.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    /// Mints a time-bounded signed GET URL for `key`.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StoreError>;
}

/// S3-compatible object store (AWS, MinIO) with path-style addressing.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn from_config(cfg: &Config) -> Self {
        let credentials = Credentials::new(
            cfg.s3_access_key.clone(),
            cfg.s3_secret_key.clone(),
            None,
            None,
            "pdfmill",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(cfg.s3_region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &cfg.s3_endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: cfg.s3_bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let svc = e.into_service_error();
                if svc.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Unavailable(svc.to_string())
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!(key = %key, "Fetched object from store");
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let len = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.into_service_error().to_string()))?;

        debug!(key = %key, bytes = len, "Stored object");
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StoreError::Unavailable(e.into_service_error().to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

/// Input key: `in/{jobId}/{randomId}-{originalName}`.
///
/// The random component keeps same-named uploads within one job from
/// colliding; the filename is reduced to its final path component so a
/// crafted name cannot escape the job's prefix.
pub fn input_key(job_id: &str, original_name: &str) -> String {
    let base = original_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("upload");
    format!("in/{}/{}-{}", job_id, Uuid::new_v4(), base)
}

/// Output key: `out/{jobId}/{timestampMs}-{operation}.{ext}`.
///
/// Every attempt produces a distinct timestamp, so a retried job never
/// overwrites the artifact of an earlier attempt.
pub fn output_key(job_id: &str, operation: Operation) -> String {
    format!(
        "out/{}/{}-{}.{}",
        job_id,
        Utc::now().timestamp_millis(),
        operation,
        operation.output_ext()
    )
}

/// Content type for a produced artifact.
pub fn output_content_type(operation: Operation) -> &'static str {
    match operation.output_ext() {
        "zip" => "application/zip",
        "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/pdf",
    }
}
