//! pdfmill — asynchronous document conversion pipeline.
//!
//! A client submits files and an operation to the Submission API, which
//! stores the inputs in an object store and enqueues a job. Workers
//! lease jobs from a Redis-backed queue, stage inputs to scratch files,
//! run an external converter (Ghostscript, LibreOffice, ImageMagick,
//! Tesseract), upload the output, and report a result. Clients poll for
//! completion and mint a time-bounded signed download URL.
//!
//! ## Module Overview
//!
//! - `api`: axum Submission API (upload, poll, download URL)
//! - `config`: environment-driven configuration
//! - `convert`: external converter invocation per operation
//! - `job`: job models and state management
//! - `queue`: Redis job queue with lease and retry semantics
//! - `store`: object store adapter (S3-compatible) and key layout
//! - `telemetry`: OpenTelemetry integration and structured logging
//! - `worker`: worker pool and per-job execution

pub mod api;
pub mod config;
pub mod convert;
pub mod job;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;
