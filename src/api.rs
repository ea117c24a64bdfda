//! Submission API: the boundary between untrusted uploads and the
//! pipeline.
//!
//! Client input errors (unknown operation, no files, oversized file) are
//! rejected synchronously with 4xx codes before any storage write or
//! enqueue. Infrastructure errors surface as 5xx; nothing is partially
//! committed, because inputs are stored before the job is enqueued and
//! orphaned inputs are swept by the bucket lifecycle policy.

use crate::config::Config;
use crate::job::{ConvertJob, InputRef, JobOptions, Operation};
use crate::queue::{JobQueue, QueueError};
use crate::store::{self, ObjectStore, StoreError};
use axum::{
    extract::{DefaultBodyLimit, Extension, Multipart, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared handler state.
pub struct AppState {
    pub queue: JobQueue,
    pub store: Arc<dyn ObjectStore>,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes as usize + 1024 * 1024;
    Router::new()
        .route("/job/:id", post(submit_job).get(poll_job))
        .route("/download/*key", get(mint_download_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(state))
}

fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(key) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("no object at {key}"))
        }
        StoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
    }
}

fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Unavailable(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string())
        }
        other => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            other.to_string(),
        ),
    }
}

struct PendingUpload {
    original_name: String,
    content_type: String,
    data: Vec<u8>,
}

/// `POST /job/:operation` — multipart field `files` (repeatable),
/// optional `ranges` (split page ranges) and `job_id` (resubmission of a
/// previously issued id; the queue deduplicates it).
///
/// Responds `{ "id": ... }` as soon as the job is durably queued; the
/// response never waits for conversion.
async fn submit_job(
    Extension(state): Extension<Arc<AppState>>,
    Path(operation): Path<String>,
    mut multipart: Multipart,
) -> axum::response::Response {
    // Validate the operation before touching storage or queue.
    let operation: Operation = match operation.parse() {
        Ok(op) => op,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "unknown_op", e.to_string()),
    };

    let mut uploads: Vec<PendingUpload> = Vec::new();
    let mut options = JobOptions::default();
    let mut job_id: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, "bad_multipart", e.to_string());
            }
        };

        match field.name() {
            Some("files") => {
                let original_name = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload".to_string());
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let data = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return json_error(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            "too_large",
                            e.to_string(),
                        );
                    }
                };
                if data.len() as u64 > state.config.max_upload_bytes {
                    return json_error(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "too_large",
                        format!(
                            "{} exceeds the {} byte upload limit",
                            original_name, state.config.max_upload_bytes
                        ),
                    );
                }
                uploads.push(PendingUpload {
                    original_name,
                    content_type,
                    data: data.to_vec(),
                });
            }
            Some("ranges") => match field.text().await {
                Ok(text) if !text.trim().is_empty() => options.ranges = Some(text),
                Ok(_) => {}
                Err(e) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_multipart", e.to_string());
                }
            },
            Some("job_id") => match field.text().await {
                Ok(text) => match Uuid::parse_str(text.trim()) {
                    Ok(id) => job_id = Some(id.to_string()),
                    Err(_) => {
                        return json_error(
                            StatusCode::BAD_REQUEST,
                            "invalid_job_id",
                            "job_id must be a UUID",
                        );
                    }
                },
                Err(e) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_multipart", e.to_string());
                }
            },
            _ => {
                // Unknown fields are ignored.
            }
        }
    }

    if uploads.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "no_files", "no files uploaded");
    }

    let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    // All inputs are validated; write them before enqueueing so a crash
    // here orphans unreferenced objects instead of producing a job with
    // missing inputs.
    let mut inputs: Vec<InputRef> = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let key = store::input_key(&job_id, &upload.original_name);
        if let Err(e) = state
            .store
            .put(&key, upload.data, &upload.content_type)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Input upload failed");
            return store_error_to_response(e);
        }
        inputs.push(InputRef {
            storage_key: key,
            original_name: upload.original_name,
            content_type: upload.content_type,
        });
    }

    let job = ConvertJob::new(
        job_id.clone(),
        operation,
        inputs,
        options,
        state.config.job_max_attempts,
    );

    let mut queue = state.queue.clone_handle();
    match queue.enqueue(&job).await {
        Ok(created) => {
            if !created {
                info!(job_id = %job_id, "Resubmission deduplicated");
            }
            (StatusCode::OK, Json(json!({ "id": job_id }))).into_response()
        }
        Err(e) => queue_error_to_response(e),
    }
}

/// `GET /job/:id` — current `{state, progress, result}`.
///
/// Unknown ids get a `not_found` payload with a 404 status, never a 5xx.
async fn poll_job(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let mut queue = state.queue.clone_handle();
    match queue.get_state(&id).await {
        Ok(snapshot) => {
            let status = if snapshot.state == "not_found" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            (status, Json(snapshot)).into_response()
        }
        Err(e) => queue_error_to_response(e),
    }
}

/// `GET /download/*key` — mints a time-bounded signed URL; the object
/// store serves the actual transfer.
async fn mint_download_url(
    Extension(state): Extension<Arc<AppState>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    match state
        .store
        .presign(&key, state.config.download_ttl)
        .await
    {
        Ok(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        Err(e) => store_error_to_response(e),
    }
}
