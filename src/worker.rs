//! Worker pool: leases jobs, stages inputs, runs the converter, and
//! uploads results.
//!
//! Each attempt owns a private scratch directory that is removed on
//! every exit path. Progress reports are advisory and flow through a
//! channel so a dropped update can never fail the attempt. Any failure
//! in the fetch → convert → upload path aborts the attempt and surfaces
//! through `report_result`, where the queue decides between retry and
//! permanent failure.

use crate::convert::Convert;
use crate::job::{ConvertJob, JobResult};
use crate::queue::{JobQueue, LeasedJob, QueueError};
use crate::store::{self, ObjectStore};
use crate::telemetry;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Progress milestones reported between pipeline stages.
const PROGRESS_STAGED: u8 = 10;
const PROGRESS_CONVERTED: u8 = 80;
const PROGRESS_UPLOADED: u8 = 95;

/// Runs one leased job to completion and reports the outcome.
pub async fn process_job(
    leased: LeasedJob,
    queue: &mut JobQueue,
    store: &dyn ObjectStore,
    converter: &dyn Convert,
) {
    let LeasedJob { job, token } = leased;
    info!(
        job_id = %job.job_id,
        operation = %job.operation,
        attempt = job.attempts_made,
        "Processing job"
    );

    // Forward advisory progress updates on a side channel; lost updates
    // are tolerated.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let mut progress_queue = queue.clone_handle();
    let progress_job_id = job.job_id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(percent) = progress_rx.recv().await {
            if let Err(e) = progress_queue.report_progress(&progress_job_id, percent).await {
                debug!(job_id = %progress_job_id, error = %e, "Progress update dropped");
            }
        }
    });

    let attempt = execute_attempt(&job, store, converter, &progress_tx).await;
    drop(progress_tx);
    let _ = forwarder.await;

    let outcome = match attempt {
        Ok(result) => Ok(result),
        Err(e) => Err(format!("{:#}", e)),
    };
    let failed = outcome.as_ref().err().cloned();

    let mut finished = job.clone();
    match &outcome {
        Ok(result) => finished.mark_completed(result.clone()),
        Err(message) => finished.mark_failed(message.clone()),
    }

    match queue.report_result(&job.job_id, &token, outcome).await {
        Ok(report) => {
            debug!(job_id = %job.job_id, outcome = ?report, "Attempt reported");
        }
        Err(QueueError::LeaseMismatch(_)) | Err(QueueError::LeaseExpired(_)) => {
            warn!(
                job_id = %job.job_id,
                "Lease no longer held, result discarded"
            );
        }
        Err(e) => {
            error!(job_id = %job.job_id, error = %e, "Failed to report job result");
        }
    }

    // Best-effort; never affects the job outcome.
    telemetry::record_attempt(&finished, failed.as_deref());
}

/// Executes one conversion attempt: stage inputs, convert, upload.
///
/// Every output write goes to a fresh, uniquely named store key, so a
/// duplicate execution after a false lease timeout wastes work but
/// cannot corrupt an earlier attempt's artifact.
pub async fn execute_attempt(
    job: &ConvertJob,
    store: &dyn ObjectStore,
    converter: &dyn Convert,
    progress: &UnboundedSender<u8>,
) -> Result<JobResult> {
    let scratch = tempfile::tempdir().context("failed to create scratch directory")?;

    let mut staged: Vec<PathBuf> = Vec::with_capacity(job.inputs.len());
    for (idx, input) in job.inputs.iter().enumerate() {
        let bytes = store
            .get(&input.storage_key)
            .await
            .with_context(|| format!("failed to fetch input {}", input.storage_key))?;

        let base = input
            .original_name
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("input");
        let path = scratch
            .path()
            .join(format!("{}-in-{:03}-{}", job.job_id, idx, base));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to stage input to {}", path.display()))?;
        staged.push(path);
    }
    let _ = progress.send(PROGRESS_STAGED);

    let output = converter
        .convert(job, &staged, scratch.path())
        .await
        .context("conversion failed")?;
    let _ = progress.send(PROGRESS_CONVERTED);

    let key = store::output_key(&job.job_id, job.operation);
    let bytes = tokio::fs::read(&output)
        .await
        .with_context(|| format!("failed to read output {}", output.display()))?;
    store
        .put(&key, bytes, store::output_content_type(job.operation))
        .await
        .with_context(|| format!("failed to upload output to {}", key))?;
    let _ = progress.send(PROGRESS_UPLOADED);

    Ok(JobResult { download_key: key })
}

/// Main worker loop: lease, process, repeat.
///
/// Runs indefinitely; the semaphore bounds concurrent job processing
/// across the pool.
pub async fn worker_loop(
    worker_id: usize,
    mut queue: JobQueue,
    semaphore: Arc<Semaphore>,
    store: Arc<dyn ObjectStore>,
    converter: Arc<dyn Convert>,
) {
    info!("Worker {} started", worker_id);

    loop {
        // A pool slot is reserved before leasing; a job is never held
        // with its lease clock running while the worker waits for
        // capacity.
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let leased = match queue.lease().await {
            Ok(Some(leased)) => leased,
            Ok(None) => {
                // Timeout, no job available
                continue;
            }
            Err(e) => {
                error!("Worker {} failed to lease job: {}", worker_id, e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let mut job_queue = queue.clone_handle();
        let store = store.clone();
        let converter = converter.clone();

        tokio::spawn(async move {
            process_job(leased, &mut job_queue, store.as_ref(), converter.as_ref()).await;
            drop(permit);
        });

        if let Ok(queue_len) = queue.queue_length().await {
            if queue_len % 10 == 0 {
                telemetry::record_worker_heartbeat(queue_len);
            }
        }
    }
}

/// Resolves once every pool slot is free, i.e. no job is in flight.
///
/// Used on shutdown after the lease loops have been stopped: in-flight
/// jobs hold permits until their results are reported, so acquiring the
/// whole pool waits for them to drain.
pub async fn wait_for_idle(semaphore: Arc<Semaphore>, slots: usize) {
    let _ = semaphore.acquire_many_owned(slots as u32).await;
}

/// Periodically returns expired-lease jobs to the pending pool.
pub async fn reclaim_loop(mut queue: JobQueue, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match queue.reclaim_expired().await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "Reclaimed expired leases"),
            Err(e) => error!("Lease reclaim pass failed: {}", e),
        }
    }
}
