//! Redis-based job queue with lease and bounded-retry semantics.
//!
//! Layout under the `pdfmill:jobs` prefix:
//! - `pending` — list of job ids, FIFO via RPUSH/BLPOP
//! - `status:{id}` — JSON job record, the single source of truth
//! - `lease:{id}` — token of the current lease holder
//! - `leases` — zset of leased job ids scored by lease expiry (unix ms)
//!
//! A job is leased rather than popped-and-owned: the lease expiry index
//! lets `reclaim_expired` return crashed workers' jobs to the pending
//! pool until the attempt budget runs out. Completion reports must carry
//! the lease token, so a worker that lost its lease to a timeout cannot
//! overwrite state written by the replacement holder.

use crate::job::{ConvertJob, JobResult, JobSnapshot, JobStatus};
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pending job id list.
const PENDING_KEY: &str = "pdfmill:jobs:pending";

/// Status key prefix for job records.
const STATUS_KEY_PREFIX: &str = "pdfmill:jobs:status";

/// Lease token key prefix.
const LEASE_KEY_PREFIX: &str = "pdfmill:jobs:lease";

/// Lease expiry index (zset, score = expiry unix ms).
const LEASE_INDEX_KEY: &str = "pdfmill:jobs:leases";

/// Job record TTL in seconds (24 hours).
const JOB_TTL_SECONDS: u64 = 86400;

/// BLPOP timeout; a `None` lease means "try again".
const DEQUEUE_TIMEOUT_SECS: f64 = 5.0;

/// Verifies the holder's token and releases the lease in one step.
///
/// KEYS[1] = lease:{id}, KEYS[2] = leases, ARGV[1] = token,
/// ARGV[2] = job id. The ZREM doubles as the fence shared with
/// `reclaim_expired`: exactly one side removes the index entry, and
/// only that side may write the job's next status. Returns 1 on
/// success, -1 when the lease is gone or already reclaimed, -2 on a
/// token mismatch.
const RELEASE_LEASE_SCRIPT: &str = r#"
local stored = redis.call('GET', KEYS[1])
if not stored then
  return -1
end
if stored ~= ARGV[1] then
  return -2
end
if redis.call('ZREM', KEYS[2], ARGV[2]) == 0 then
  return -1
end
redis.call('DEL', KEYS[1])
return 1
"#;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("job payload corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lease token mismatch for job {0}")]
    LeaseMismatch(String),
    #[error("lease expired for job {0}")]
    LeaseExpired(String),
}

/// A job handed to exactly one worker, plus the token that worker must
/// present when reporting the attempt's outcome.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: ConvertJob,
    pub token: String,
}

/// What `report_result` did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Completed,
    Retried,
    FailedPermanently,
}

/// Redis-backed queue manager shared by the API (enqueue, state reads)
/// and the workers (lease, progress, results, reclaim).
pub struct JobQueue {
    pub conn: ConnectionManager,
    lease_timeout: Duration,
}

impl JobQueue {
    pub fn new(conn: ConnectionManager, lease_timeout: Duration) -> Self {
        Self { conn, lease_timeout }
    }

    /// A second handle onto the same queue (multiplexed connection).
    pub fn clone_handle(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            lease_timeout: self.lease_timeout,
        }
    }

    fn status_key(job_id: &str) -> String {
        format!("{}:{}", STATUS_KEY_PREFIX, job_id)
    }

    fn lease_key(job_id: &str) -> String {
        format!("{}:{}", LEASE_KEY_PREFIX, job_id)
    }

    /// Enqueues a job, idempotently under its id.
    ///
    /// The status key is created with SET NX, so a submission retried
    /// with the same job id finds the key already present and does not
    /// push a second pending entry. Returns `false` for such duplicates.
    pub async fn enqueue(&mut self, job: &ConvertJob) -> Result<bool, QueueError> {
        let job_json = serde_json::to_string(job)?;

        let created: Option<String> = redis::cmd("SET")
            .arg(Self::status_key(&job.job_id))
            .arg(&job_json)
            .arg("NX")
            .arg("EX")
            .arg(JOB_TTL_SECONDS)
            .query_async(&mut self.conn)
            .await?;

        if created.is_none() {
            debug!(job_id = %job.job_id, "Duplicate enqueue ignored");
            return Ok(false);
        }

        self.conn
            .rpush::<_, _, ()>(PENDING_KEY, &job.job_id)
            .await?;

        info!(
            job_id = %job.job_id,
            operation = %job.operation,
            inputs = job.inputs.len(),
            "Enqueued job"
        );
        Ok(true)
    }

    /// Leases the next pending job (blocking with timeout).
    ///
    /// Marks the job active, bumps its attempt counter, and records a
    /// fresh lease token with an expiry in the lease index. Returns
    /// `Ok(None)` if no job arrived within the timeout window.
    pub async fn lease(&mut self) -> Result<Option<LeasedJob>, QueueError> {
        let popped: Option<(String, String)> = self
            .conn
            .blpop(PENDING_KEY, DEQUEUE_TIMEOUT_SECS)
            .await?;

        let Some((_key, job_id)) = popped else {
            return Ok(None);
        };

        let Some(mut job) = self.load_job(&job_id).await? else {
            // Record expired between push and pop; nothing to run.
            warn!(job_id = %job_id, "Pending job has no status record, dropping");
            return Ok(None);
        };

        job.start_attempt();

        let token = Uuid::new_v4().to_string();
        let expiry_ms = Utc::now().timestamp_millis() + self.lease_timeout.as_millis() as i64;
        let job_json = serde_json::to_string(&job)?;

        // Status, lease token, and reclaim-index entry land in one MULTI,
        // so a job observed Active always has a lease entry the reclaimer
        // can find. A crash here leaves all three unwritten and the pop
        // lost, never a stuck Active record.
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(Self::status_key(&job_id))
            .arg(&job_json)
            .arg("EX")
            .arg(JOB_TTL_SECONDS)
            .ignore()
            .cmd("SET")
            .arg(Self::lease_key(&job_id))
            .arg(&token)
            .arg("EX")
            .arg(self.lease_timeout.as_secs().max(1))
            .ignore()
            .zadd(LEASE_INDEX_KEY, &job_id, expiry_ms)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await?;

        debug!(
            job_id = %job_id,
            attempt = job.attempts_made,
            "Leased job"
        );
        Ok(Some(LeasedJob { job, token }))
    }

    /// Advisory progress update; lost updates are tolerated.
    pub async fn report_progress(&mut self, job_id: &str, percent: u8) -> Result<(), QueueError> {
        let Some(mut job) = self.load_job(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Active {
            return Ok(());
        }
        job.record_progress(percent);
        self.write_job(&job).await
    }

    /// Reports the terminal outcome of one attempt.
    ///
    /// The caller's lease token must match the stored one; a stale
    /// holder (false-positive lease timeout) is rejected and mutates
    /// nothing. Token verification and lease release happen in a single
    /// script, so a reclaimer that already took the job back cannot be
    /// raced into a double status write. A failed attempt is re-enqueued
    /// while attempts remain, after which the job is permanently failed.
    pub async fn report_result(
        &mut self,
        job_id: &str,
        token: &str,
        outcome: Result<JobResult, String>,
    ) -> Result<ReportOutcome, QueueError> {
        let verdict: i64 = redis::Script::new(RELEASE_LEASE_SCRIPT)
            .key(Self::lease_key(job_id))
            .key(LEASE_INDEX_KEY)
            .arg(token)
            .arg(job_id)
            .invoke_async(&mut self.conn)
            .await?;
        match verdict {
            -2 => return Err(QueueError::LeaseMismatch(job_id.to_string())),
            v if v < 0 => return Err(QueueError::LeaseExpired(job_id.to_string())),
            _ => {}
        }

        let Some(mut job) = self.load_job(job_id).await? else {
            return Err(QueueError::LeaseExpired(job_id.to_string()));
        };

        match outcome {
            Ok(result) => {
                job.mark_completed(result);
                self.write_job(&job).await?;
                info!(
                    job_id = %job_id,
                    duration_ms = ?job.processing_duration_ms(),
                    "Job completed"
                );
                Ok(ReportOutcome::Completed)
            }
            Err(message) => {
                if job.retryable() {
                    job.error = Some(message.clone());
                    job.requeue_for_retry();
                    self.write_job(&job).await?;
                    self.conn.rpush::<_, _, ()>(PENDING_KEY, job_id).await?;
                    info!(
                        job_id = %job_id,
                        attempt = job.attempts_made,
                        error = %message,
                        "Attempt failed, job re-queued"
                    );
                    Ok(ReportOutcome::Retried)
                } else {
                    job.mark_failed(message.clone());
                    self.write_job(&job).await?;
                    warn!(
                        job_id = %job_id,
                        attempts = job.attempts_made,
                        error = %message,
                        "Job failed permanently"
                    );
                    Ok(ReportOutcome::FailedPermanently)
                }
            }
        }
    }

    /// Current state for pollers; unknown or expired ids are `not_found`.
    pub async fn get_state(&mut self, job_id: &str) -> Result<JobSnapshot, QueueError> {
        match self.load_job(job_id).await? {
            Some(job) => Ok(JobSnapshot::from(&job)),
            None => Ok(JobSnapshot::not_found()),
        }
    }

    /// Returns expired-lease jobs to the pending pool.
    ///
    /// Each reclaimed id is first removed from the lease index; only the
    /// caller that wins that removal requeues the job, so concurrent
    /// reclaimers cannot double-queue it. Jobs out of attempts are
    /// marked failed instead. Returns how many jobs were reclaimed.
    pub async fn reclaim_expired(&mut self) -> Result<usize, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let expired: Vec<String> = self
            .conn
            .zrangebyscore(LEASE_INDEX_KEY, "-inf", now_ms)
            .await?;

        let mut reclaimed = 0;
        for job_id in expired {
            let removed: usize = self.conn.zrem(LEASE_INDEX_KEY, &job_id).await?;
            if removed == 0 {
                continue;
            }
            self.conn.del::<_, ()>(Self::lease_key(&job_id)).await?;

            let Some(mut job) = self.load_job(&job_id).await? else {
                continue;
            };
            if job.status != JobStatus::Active {
                continue;
            }

            if job.retryable() {
                job.error = Some("lease expired".to_string());
                job.requeue_for_retry();
                self.write_job(&job).await?;
                self.conn.rpush::<_, _, ()>(PENDING_KEY, &job_id).await?;
                warn!(
                    job_id = %job_id,
                    attempt = job.attempts_made,
                    "Lease expired, job re-queued"
                );
            } else {
                job.mark_failed("lease expired after max attempts".to_string());
                self.write_job(&job).await?;
                warn!(job_id = %job_id, "Lease expired, attempts exhausted");
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Returns the current pending queue length.
    pub async fn queue_length(&mut self) -> Result<usize, QueueError> {
        let len: usize = self.conn.llen(PENDING_KEY).await?;
        Ok(len)
    }

    async fn load_job(&mut self, job_id: &str) -> Result<Option<ConvertJob>, QueueError> {
        let json: Option<String> = self.conn.get(Self::status_key(job_id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_job(&mut self, job: &ConvertJob) -> Result<(), QueueError> {
        let json = serde_json::to_string(job)?;
        self.conn
            .set_ex::<_, _, ()>(Self::status_key(&job.job_id), json, JOB_TTL_SECONDS)
            .await?;
        Ok(())
    }
}
