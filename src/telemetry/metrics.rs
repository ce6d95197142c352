//! Metric instrument factories for deferq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"deferq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for deferq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("deferq")
}

/// Counter: defer attempts.
/// Labels: `queue`, `result` ("ok" | "already_enqueued" | "error").
pub fn jobs_deferred() -> Counter<u64> {
    meter()
        .u64_counter("deferq.jobs.deferred")
        .with_description("Number of jobs deferred")
        .build()
}

/// Counter: job status transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("deferq.jobs.state_transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "empty").
pub fn job_claims() -> Counter<u64> {
    meter()
        .u64_counter("deferq.jobs.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Histogram: execution attempt duration in milliseconds.
/// Labels: `task`, `outcome`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("deferq.jobs.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: claimed jobs naming a task the worker does not know.
/// Labels: `task`.
pub fn unknown_tasks() -> Counter<u64> {
    meter()
        .u64_counter("deferq.tasks.unknown")
        .with_description("Claimed jobs with no registered task")
        .build()
}
