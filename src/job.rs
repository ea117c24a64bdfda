//! Job models and state management for the conversion queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of supported conversion operations.
///
/// Dispatch on this enum is exhaustive, so an "unknown op" can only be
/// rejected at the API boundary, never discovered mid-conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Merge,
    Split,
    Compress,
    WordToPdf,
    PdfToWord,
    Ocr,
    Flatten,
}

impl Operation {
    /// File extension of the operation's output artifact.
    pub fn output_ext(&self) -> &'static str {
        match self {
            Operation::Split => "zip",
            Operation::PdfToWord => "docx",
            Operation::Merge
            | Operation::Compress
            | Operation::WordToPdf
            | Operation::Ocr
            | Operation::Flatten => "pdf",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Merge => "merge",
            Operation::Split => "split",
            Operation::Compress => "compress",
            Operation::WordToPdf => "word-to-pdf",
            Operation::PdfToWord => "pdf-to-word",
            Operation::Ocr => "ocr",
            Operation::Flatten => "flatten",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Operation::Merge),
            "split" => Ok(Operation::Split),
            "compress" => Ok(Operation::Compress),
            "word-to-pdf" => Ok(Operation::WordToPdf),
            "pdf-to-word" => Ok(Operation::PdfToWord),
            "ocr" => Ok(Operation::Ocr),
            "flatten" => Ok(Operation::Flatten),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

/// Reference to one uploaded input object, in upload order.
///
/// Order matters: merge concatenates inputs in this exact sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRef {
    pub storage_key: String,
    pub original_name: String,
    pub content_type: String,
}

/// Per-operation options supplied at submission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Page ranges for split, e.g. `"1-3,5"`. None splits every page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<String>,
}

/// Terminal result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Object store key of the output artifact.
    pub download_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One conversion request, tracked from submission through terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertJob {
    pub job_id: String,
    pub operation: Operation,
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub options: JobOptions,
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<JobResult>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ConvertJob {
    pub fn new(
        job_id: String,
        operation: Operation,
        inputs: Vec<InputRef>,
        options: JobOptions,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            operation,
            inputs,
            options,
            status: JobStatus::Queued,
            progress: 0,
            result: None,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn with_generated_id(
        operation: Operation,
        inputs: Vec<InputRef>,
        options: JobOptions,
        max_attempts: u32,
    ) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            operation,
            inputs,
            options,
            max_attempts,
        )
    }

    /// Marks the start of one execution attempt under a fresh lease.
    pub fn start_attempt(&mut self) {
        self.status = JobStatus::Active;
        self.attempts_made += 1;
        self.updated_at = Utc::now();
    }

    /// Advances progress; regressions are dropped (monotonic while active).
    pub fn record_progress(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            self.updated_at = Utc::now();
        }
    }

    pub fn mark_completed(&mut self, result: JobResult) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Returns true if another attempt is allowed after a failure.
    pub fn retryable(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Resets a failed attempt back to queued for the next lease.
    pub fn requeue_for_retry(&mut self) {
        self.status = JobStatus::Queued;
        self.updated_at = Utc::now();
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.status == JobStatus::Completed || self.status == JobStatus::Failed {
            Some(
                self.updated_at
                    .signed_duration_since(self.created_at)
                    .num_milliseconds(),
            )
        } else {
            None
        }
    }
}

/// Read-only view returned to polling clients.
///
/// `state` extends [`JobStatus`] with `not_found` so that unknown or
/// expired ids are a payload, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub state: String,
    pub progress: u8,
    pub result: Option<JobResult>,
}

impl JobSnapshot {
    pub fn not_found() -> Self {
        Self {
            state: "not_found".to_string(),
            progress: 0,
            result: None,
        }
    }
}

impl From<&ConvertJob> for JobSnapshot {
    fn from(job: &ConvertJob) -> Self {
        Self {
            state: job.status.to_string(),
            progress: job.progress,
            result: job.result.clone(),
        }
    }
}
