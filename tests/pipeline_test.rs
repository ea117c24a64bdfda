//! Integration tests for the conversion pipeline.
//!
//! These tests drive the submission API, the queue, and the worker
//! execution path against an in-memory object store and a stub
//! converter, so no native conversion tools are needed.
//!
//! ## Running Tests
//!
//! ```bash
//! # Unit tests (no external dependencies)
//! cargo test --lib
//!
//! # Integration tests (requires Redis)
//! docker run -d -p 6379:6379 redis:7-alpine
//! cargo test --test pipeline_test -- --ignored --test-threads=1
//! ```

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use pdfmill::api::{self, AppState};
use pdfmill::config::Config;
use pdfmill::convert::{Convert, ConvertError};
use pdfmill::job::{ConvertJob, InputRef, JobOptions, Operation};
use pdfmill::queue::JobQueue;
use pdfmill::store::{ObjectStore, StoreError};
use pdfmill::worker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::util::ServiceExt;

/// In-memory object store standing in for S3.
#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        if !self.objects.lock().unwrap().contains_key(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(format!(
            "https://store.test/{}?expires={}",
            key,
            ttl.as_secs()
        ))
    }
}

/// Converter that writes a deterministic artifact without external tools.
struct StubConverter {
    fail_first: AtomicBool,
}

impl StubConverter {
    fn new() -> Self {
        Self {
            fail_first: AtomicBool::new(false),
        }
    }

    fn failing_once() -> Self {
        Self {
            fail_first: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Convert for StubConverter {
    async fn convert(
        &self,
        job: &ConvertJob,
        inputs: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf, ConvertError> {
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(ConvertError::ToolFailed {
                tool: "gs".to_string(),
                code: "1".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        assert!(!inputs.is_empty());
        let out = scratch.join(format!("{}-stub.{}", job.job_id, job.operation.output_ext()));
        std::fs::write(&out, b"converted output bytes").unwrap();
        Ok(out)
    }
}

fn test_config() -> Config {
    Config {
        redis_url: "redis://127.0.0.1/".to_string(),
        s3_endpoint: None,
        s3_region: "us-east-1".to_string(),
        s3_access_key: "test".to_string(),
        s3_secret_key: "test".to_string(),
        s3_bucket: "pdfmill-test".to_string(),
        download_ttl: Duration::from_secs(3600),
        max_upload_bytes: 1024 * 1024,
        worker_concurrency: 1,
        lease_timeout: Duration::from_secs(60),
        job_max_attempts: 2,
        api_bind: "127.0.0.1:0".to_string(),
    }
}

async fn redis_conn() -> redis::aio::ConnectionManager {
    let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    redis::aio::ConnectionManager::new(client).await.unwrap()
}

async fn test_state(store: Arc<MemoryStore>, config: Config) -> Arc<AppState> {
    Arc::new(AppState {
        queue: JobQueue::new(redis_conn().await, config.lease_timeout),
        store,
        config,
    })
}

const BOUNDARY: &str = "pipelineboundary";

fn multipart_body(files: &[(&str, &[u8])], fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (filename, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn submit_request(operation: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/job/{operation}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Full pipeline: submit, lease, convert, poll, mint a download URL.
#[tokio::test]
#[ignore]
async fn test_submit_process_poll_download() {
    let store = Arc::new(MemoryStore::default());
    let state = test_state(store.clone(), test_config()).await;
    let app = api::router(state.clone());

    let body = multipart_body(&[("a.pdf", b"%PDF-1.4 a"), ("b.pdf", b"%PDF-1.4 b")], &[]);
    let resp = app
        .clone()
        .oneshot(submit_request("merge", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let id = json_body(resp).await["id"].as_str().unwrap().to_string();

    // Both inputs were stored under the job's prefix before enqueue.
    assert_eq!(store.len(), 2);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/job/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let snapshot = json_body(resp).await;
    assert_eq!(snapshot["state"], "queued");

    // Run the worker path for the leased job.
    let mut queue = state.queue.clone_handle();
    let leased = queue.lease().await.unwrap().expect("job should be pending");
    assert_eq!(leased.job.job_id, id);
    assert_eq!(leased.job.inputs.len(), 2);
    // Merge output depends on page order, so the job record must keep
    // the inputs in submission order.
    assert_eq!(leased.job.inputs[0].original_name, "a.pdf");
    assert_eq!(leased.job.inputs[1].original_name, "b.pdf");
    assert!(leased.job.inputs[0].storage_key.ends_with("-a.pdf"));
    assert!(leased.job.inputs[1].storage_key.ends_with("-b.pdf"));

    let converter = StubConverter::new();
    worker::process_job(leased, &mut queue, store.as_ref(), &converter).await;

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/job/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let snapshot = json_body(resp).await;
    assert_eq!(snapshot["state"], "completed");
    assert_eq!(snapshot["progress"], 100);
    let key = snapshot["result"]["download_key"].as_str().unwrap();
    assert!(key.starts_with(&format!("out/{id}/")));
    assert!(key.ends_with("-merge.pdf"));

    // The output object is non-empty and presign-able.
    assert!(!store.get(key).await.unwrap().is_empty());
    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/download/{key}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let url = json_body(resp).await["url"].as_str().unwrap().to_string();
    assert!(url.contains(key));
}

/// Unknown operations are rejected at the boundary, before any storage
/// write or enqueue.
#[tokio::test]
#[ignore]
async fn test_unknown_operation_rejected_at_boundary() {
    let store = Arc::new(MemoryStore::default());
    let state = test_state(store.clone(), test_config()).await;
    let app = api::router(state);

    let body = multipart_body(&[("a.pdf", b"%PDF-1.4")], &[]);
    let resp = app.oneshot(submit_request("rotate", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "unknown_op");
    assert_eq!(store.len(), 0);
}

#[tokio::test]
#[ignore]
async fn test_empty_submission_rejected() {
    let store = Arc::new(MemoryStore::default());
    let state = test_state(store.clone(), test_config()).await;
    let app = api::router(state);

    let body = multipart_body(&[], &[]);
    let resp = app.oneshot(submit_request("merge", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "no_files");
    assert_eq!(store.len(), 0);
}

/// Oversized uploads are rejected before anything is written.
#[tokio::test]
#[ignore]
async fn test_oversized_upload_rejected_before_storage() {
    let store = Arc::new(MemoryStore::default());
    let mut config = test_config();
    config.max_upload_bytes = 16;
    let state = test_state(store.clone(), config).await;
    let app = api::router(state);

    let big = vec![0u8; 64];
    let body = multipart_body(&[("big.pdf", &big)], &[]);
    let resp = app.oneshot(submit_request("compress", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(resp).await["error"], "too_large");
    assert_eq!(store.len(), 0);
}

#[tokio::test]
#[ignore]
async fn test_unknown_job_id_is_not_found_payload() {
    let store = Arc::new(MemoryStore::default());
    let state = test_state(store, test_config()).await;
    let app = api::router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/job/b5c8e3fb-0000-0000-0000-000000000000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let snapshot = json_body(resp).await;
    assert_eq!(snapshot["state"], "not_found");
    assert!(snapshot["result"].is_null());
}

/// Resubmitting under the same job id does not queue a second job.
#[tokio::test]
#[ignore]
async fn test_resubmission_is_idempotent() {
    let store = Arc::new(MemoryStore::default());
    let state = test_state(store.clone(), test_config()).await;
    let app = api::router(state.clone());

    let job_id = uuid::Uuid::new_v4().to_string();
    let fields = [("job_id", job_id.as_str())];

    let body = multipart_body(&[("a.pdf", b"%PDF-1.4")], &fields);
    let resp = app
        .clone()
        .oneshot(submit_request("flatten", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["id"], job_id.as_str());

    let body = multipart_body(&[("a.pdf", b"%PDF-1.4")], &fields);
    let resp = app.oneshot(submit_request("flatten", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["id"], job_id.as_str());

    // Exactly one pending entry for the id.
    let mut queue = state.queue.clone_handle();
    let first = queue.lease().await.unwrap().expect("one pending job");
    assert_eq!(first.job.job_id, job_id);
    // Finish it so the queue is clean for other tests.
    let converter = StubConverter::new();
    worker::process_job(first, &mut queue, store.as_ref(), &converter).await;
    assert!(queue.lease().await.unwrap().is_none());
}

/// A failed attempt retries and the successful attempt writes a fresh
/// output key; the job converges to completed.
#[tokio::test]
#[ignore]
async fn test_failed_attempt_retries_with_distinct_output() {
    let store = Arc::new(MemoryStore::default());
    let mut queue = JobQueue::new(redis_conn().await, Duration::from_secs(60));

    let job = ConvertJob::with_generated_id(
        Operation::Compress,
        vec![InputRef {
            storage_key: "in/retry/a.pdf".to_string(),
            original_name: "a.pdf".to_string(),
            content_type: "application/pdf".to_string(),
        }],
        JobOptions::default(),
        2,
    );
    store
        .put("in/retry/a.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
        .await
        .unwrap();
    queue.enqueue(&job).await.unwrap();

    let converter = StubConverter::failing_once();

    let first = queue.lease().await.unwrap().unwrap();
    worker::process_job(first, &mut queue, store.as_ref(), &converter).await;
    let snap = queue.get_state(&job.job_id).await.unwrap();
    assert_eq!(snap.state, "queued");

    let second = queue.lease().await.unwrap().unwrap();
    assert_eq!(second.job.attempts_made, 2);
    worker::process_job(second, &mut queue, store.as_ref(), &converter).await;

    let snap = queue.get_state(&job.job_id).await.unwrap();
    assert_eq!(snap.state, "completed");
    let key = snap.result.unwrap().download_key;
    assert!(key.starts_with(&format!("out/{}/", job.job_id)));
    assert!(!store.get(&key).await.unwrap().is_empty());
}

/// A worker without a free pool slot must not lease: leasing first
/// would let the lease clock run while the job waits for capacity.
#[tokio::test]
#[ignore]
async fn test_worker_does_not_lease_without_free_slot() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::default());
    let mut queue = JobQueue::new(redis_conn().await, Duration::from_secs(60));

    let job = ConvertJob::with_generated_id(
        Operation::Flatten,
        vec![InputRef {
            storage_key: "in/slot/a.pdf".to_string(),
            original_name: "a.pdf".to_string(),
            content_type: "application/pdf".to_string(),
        }],
        JobOptions::default(),
        2,
    );
    store
        .put("in/slot/a.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
        .await
        .unwrap();
    queue.enqueue(&job).await.unwrap();

    let store_dyn: Arc<dyn ObjectStore> = store.clone();
    let converter: Arc<dyn Convert> = Arc::new(StubConverter::new());
    let semaphore = Arc::new(tokio::sync::Semaphore::new(0));
    let loop_handle = tokio::spawn(worker::worker_loop(
        0,
        queue.clone_handle(),
        semaphore,
        store_dyn,
        converter,
    ));

    // With no capacity the loop parks before leasing; the job stays
    // pending and its attempt counter untouched.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let snap = queue.get_state(&job.job_id).await.unwrap();
    assert_eq!(snap.state, "queued");

    let leased = queue.lease().await.unwrap().expect("job still pending");
    assert_eq!(leased.job.job_id, job.job_id);
    assert_eq!(leased.job.attempts_made, 1);
    loop_handle.abort();

    // Finish the job so the queue is clean for other tests.
    let converter = StubConverter::new();
    worker::process_job(leased, &mut queue, store.as_ref(), &converter).await;
}

/// Two attempts never share an output key (no redis needed).
#[tokio::test]
async fn test_attempts_write_distinct_output_keys() {
    let store = MemoryStore::default();
    store
        .put("in/k/a.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
        .await
        .unwrap();

    let job = ConvertJob::with_generated_id(
        Operation::Compress,
        vec![InputRef {
            storage_key: "in/k/a.pdf".to_string(),
            original_name: "a.pdf".to_string(),
            content_type: "application/pdf".to_string(),
        }],
        JobOptions::default(),
        3,
    );
    let converter = StubConverter::new();

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let first = worker::execute_attempt(&job, &store, &converter, &tx)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = worker::execute_attempt(&job, &store, &converter, &tx)
        .await
        .unwrap();

    assert_ne!(first.download_key, second.download_key);
    assert!(!store.get(&first.download_key).await.unwrap().is_empty());
    assert!(!store.get(&second.download_key).await.unwrap().is_empty());
}
