//! Telemetry and structured logging for the conversion pipeline.
//!
//! All recording here is best-effort: a telemetry failure must never
//! change the outcome of a job.

use crate::job::ConvertJob;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

/// Attempt duration above which a warning is logged (external tools
/// usually finish within this budget).
const SLOW_ATTEMPT_MS: i64 = 30_000;

/// Records one finished conversion attempt.
///
/// Emits a span with the job id, operation, attempt count, and outcome;
/// `error` carries the failure message when the attempt did not produce
/// a result.
pub fn record_attempt(job: &ConvertJob, error: Option<&str>) {
    let tracer = global::tracer("pdfmill-worker");
    let mut span = tracer.start("conversion_attempt");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("operation", job.operation.to_string()));
    span.set_attribute(KeyValue::new("attempt", job.attempts_made as i64));
    span.set_attribute(KeyValue::new("inputs", job.inputs.len() as i64));
    span.set_attribute(KeyValue::new("succeeded", error.is_none()));

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            operation = %job.operation,
            duration_ms = duration_ms,
            "Conversion attempt finished"
        );

        if duration_ms > SLOW_ATTEMPT_MS {
            warn!(
                job_id = %job.job_id,
                operation = %job.operation,
                duration_ms = duration_ms,
                "Conversion attempt exceeded duration budget"
            );
        }
    }

    if let Some(error) = error {
        span.set_attribute(KeyValue::new("error", error.to_string()));
        warn!(
            job_id = %job.job_id,
            operation = %job.operation,
            attempt = job.attempts_made,
            error = %error,
            "Conversion attempt failed"
        );
    }

    span.end();
}

/// Records a worker heartbeat for monitoring pool health.
pub fn record_worker_heartbeat(queue_length: usize) {
    let tracer = global::tracer("pdfmill-worker");
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue_length = queue_length, "Worker heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Called once at startup. Configuration comes from the environment:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` — collector endpoint (default http://localhost:4317)
/// - `OTEL_SERVICE_NAME` — service name (default pdfmill)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "pdfmill".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    global::set_tracer_provider(tracer.provider().unwrap());

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}
