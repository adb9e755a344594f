//! Integration tests for telemetry initialization and span helpers.

use poolsched::model::{IntentionId, IntentionKind, JobId, WorkerId};
use poolsched::telemetry::job::{record_intention_result, record_job_outcome, start_job_span};
use poolsched::telemetry::{TelemetryConfig, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // initialization may fail and that is acceptable here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "schedworker-test".to_string(),
        log_level: "debug".to_string(),
    };
    let guard = init_telemetry(config);
    if let Ok(guard) = guard {
        guard.force_flush();
    }
}

#[test]
fn job_span_records_results_and_outcome() {
    let kind = IntentionKind::new("github.raw");
    let span = start_job_span(JobId::new(), WorkerId::new(), &kind);
    record_intention_result(&span, IntentionId::new(), "success");
    record_intention_result(&span, IntentionId::new(), "incomplete");
    record_job_outcome(&span, "success");

    let dissolved = start_job_span(JobId::new(), WorkerId::new(), &kind);
    record_job_outcome(&dissolved, "dissolved");

    let lost = start_job_span(JobId::new(), WorkerId::new(), &kind);
    record_intention_result(&lost, IntentionId::new(), "claim_lost");
    record_job_outcome(&lost, "claim_lost");
}

#[test]
fn metrics_record_without_a_provider() {
    metrics::jobs_created().add(1, &[]);
    metrics::claim_conflicts().add(2, &[]);
    metrics::claims_lost().add(1, &[]);
    metrics::run_duration_ms().record(12.5, &[]);
}
