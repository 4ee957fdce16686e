//! Observability metrics for the orchestration engine.
//!
//! Metrics are exported through the `metrics` crate facade and are
//! Prometheus-compatible once a recorder is installed.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `warden_identity_operations_total` | Counter | `operation` | Identity create/ensure/revoke operations |
//! | `warden_token_issues_total` | Counter | `result` | Token issues by result (exchanged, cache_hit, rejected) |
//! | `warden_job_transitions_total` | Counter | `from_state`, `to_state` | Job state transitions |
//! | `warden_scope_converge_total` | Counter | `status` | Per-scope converge outcomes |
//! | `warden_scope_converge_duration_seconds` | Histogram | - | Time to converge one scope |
//! | `warden_retries_total` | Counter | `operation` | Transient-failure retries |

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Identity registry operations.
    pub const IDENTITY_OPERATIONS_TOTAL: &str = "warden_identity_operations_total";
    /// Counter: Token issues by result.
    pub const TOKEN_ISSUES_TOTAL: &str = "warden_token_issues_total";
    /// Counter: Job state transitions.
    pub const JOB_TRANSITIONS_TOTAL: &str = "warden_job_transitions_total";
    /// Counter: Per-scope converge outcomes.
    pub const SCOPE_CONVERGE_TOTAL: &str = "warden_scope_converge_total";
    /// Histogram: Time to converge one scope in seconds.
    pub const SCOPE_CONVERGE_DURATION_SECONDS: &str = "warden_scope_converge_duration_seconds";
    /// Counter: Transient-failure retries.
    pub const RETRIES_TOTAL: &str = "warden_retries_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Operation name (create, ensure, revoke, submit, poll).
    pub const OPERATION: &str = "operation";
    /// Result status (exchanged, cache_hit, rejected, succeeded, failed).
    pub const RESULT: &str = "result";
    /// Previous job state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target job state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Converge outcome status (succeeded, failed, running).
    pub const STATUS: &str = "status";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across services.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records an identity registry operation.
    pub fn record_identity_operation(&self, operation: &str) {
        counter!(
            names::IDENTITY_OPERATIONS_TOTAL,
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Records a token issue and how it was satisfied.
    pub fn record_token_issue(&self, result: &str) {
        counter!(
            names::TOKEN_ISSUES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a job state transition.
    pub fn record_job_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::JOB_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records the outcome of one scope's converge pass.
    pub fn record_scope_converge(&self, status: &str, duration: Duration) {
        counter!(
            names::SCOPE_CONVERGE_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
        histogram!(names::SCOPE_CONVERGE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a retry of a transient external failure.
    pub fn record_retry(&self, operation: &str) {
        counter!(
            names::RETRIES_TOTAL,
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }
}
