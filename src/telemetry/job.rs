//! Job execution span helpers.

use crate::model::{IntentionId, IntentionKind, JobId, WorkerId};
use tracing::Span;

/// Span covering one job from first run to archival.
///
/// `job.outcome` is filled in by [`record_job_outcome`].
pub fn start_job_span(job_id: JobId, worker_id: WorkerId, kind: &IntentionKind) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "job.worker" = %worker_id,
        "job.kind" = %kind,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Emit a per-intention result event inside the job span.
pub fn record_intention_result(span: &Span, intention: IntentionId, result: &str) {
    span.in_scope(|| {
        tracing::info!(intention = %intention, result, "intention_result");
    });
}

/// Outcome is "success", "error", "dissolved" or "claim_lost".
pub fn record_job_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}
