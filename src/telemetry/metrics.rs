//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: jobs submitted.
/// Labels: `job_type`.
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: applied store transitions.
/// Labels: `from`, `to`.
pub fn job_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.transitions")
        .with_description("Number of applied job status transitions")
        .build()
}

/// Counter: pgmq operations.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: retry entries moved back into the dispatch queue.
pub fn retries_promoted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.retries.promoted")
        .with_description("Retry entries promoted to the dispatch queue")
        .build()
}

/// Counter: jobs that exhausted retries.
/// Labels: `job_type`.
pub fn jobs_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.dead_lettered")
        .with_description("Jobs moved to the dead-letter queue")
        .build()
}

/// Counter: jobs whose type has no registered handler.
/// Labels: `job_type`.
pub fn jobs_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.unroutable")
        .with_description("Jobs with no matching handler")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `job_type`, `outcome` ("succeeded" | "failed").
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.handler.duration_ms")
        .with_description("Handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}
