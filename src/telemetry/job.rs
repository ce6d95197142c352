//! Job execution span helpers.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one execution attempt.
///
/// The `job.outcome` field is declared empty and filled in when the
/// attempt finishes.
pub fn start_job_span(task: &str, job_id: JobId, attempt: u32, slot: usize) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.task" = task,
        "job.id" = job_id.0,
        "job.attempt" = attempt,
        "worker.slot" = slot,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record a status transition on the span and set its outcome field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.outcome", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
