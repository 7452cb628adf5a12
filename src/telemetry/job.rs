//! Job execution span helpers.

use crate::model::job::{JobId, Status};
use tracing::Span;

/// Start a span covering one dequeued job, from load to final transition.
pub fn start_job_span(worker: &str, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.worker" = worker,
        "job.id" = %job_id,
        "job.type" = tracing::field::Empty,
        "job.attempts" = tracing::field::Empty,
    )
}

/// Fill in the job fields once the record is loaded.
pub fn record_job(span: &Span, job_type: &str, attempts: u32) {
    span.record("job.type", job_type);
    span.record("job.attempts", attempts);
}

/// Emit a status-transition event scoped to the given span.
pub fn record_status_transition(span: &Span, from: Status, to: Status) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "status_transition");
    });
}
