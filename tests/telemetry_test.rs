//! Integration tests for telemetry initialization and span helpers.

use deferq::JobId;
use deferq::telemetry::{TelemetryConfig, init_telemetry, job};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // init returning Err is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "deferq-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn job_span_creates_and_records_transition() {
    let span = job::start_job_span("sum", JobId(7), 1, 0);
    job::record_state_transition(&span, "doing", "succeeded");
}

#[test]
fn metric_instruments_build_without_provider() {
    use opentelemetry::KeyValue;

    deferq::telemetry::metrics::jobs_deferred().add(1, &[KeyValue::new("queue", "sums")]);
    deferq::telemetry::metrics::job_duration_ms().record(1.5, &[]);
}
