//! Structured observability hooks for grader run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span, attached with `Instrument`
//! - Emission functions for key lifecycle events: start, check, step,
//!   rate-limit decision, hard failure, finish
//!
//! Events are emitted at `info!` level (hard failures at `error!`), filtered
//! by `RUST_LOG`. For JSON output, pass `--json` to the CLI.

use tracing::{error, info};

use crate::check::UnitState;

/// Run-scoped span tagged with the run id.
///
/// # Example
///
/// ```ignore
/// work.instrument(run_span(&run_id)).await
/// // every event inside is associated with run_id
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("grader.run", run_id = %run_id)
}

/// Fresh random identifier for one grader run.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Emit event: run started for a submission.
pub fn emit_run_started(run_id: &str, submission_id: &str, is_local: bool, checks: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        submission_id = %submission_id,
        is_local = is_local,
        checks = checks,
    );
}

/// Emit event: a check unit finished.
pub fn emit_check_finished(name: &str, score: Option<f64>, duration_ms: u64, state: UnitState) {
    info!(
        event = "check.finished",
        name = %name,
        score = ?score,
        duration_ms = duration_ms,
        state = ?state,
    );
}

/// Emit event: a setup or teardown step finished.
pub fn emit_step_finished(kind: &str, name: &str, duration_ms: u64, proceed: bool) {
    info!(
        event = "step.finished",
        kind = %kind,
        name = %name,
        duration_ms = duration_ms,
        proceed = proceed,
    );
}

/// Emit event: the rate limiter decided whether this run counts.
pub fn emit_rate_limit_decided(used: u32, budget: u32, counts: bool) {
    info!(
        event = "rate_limit.decided",
        used = used,
        budget = budget,
        counts = counts,
    );
}

/// Emit event: the run ended in a hard failure.
pub fn emit_hard_failure(run_id: &str, cause: &dyn std::fmt::Display) {
    error!(event = "run.hard_failure", run_id = %run_id, cause = %cause);
}

/// Emit event: run finished with duration, outcome and score.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, outcome: &str, score: f64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        outcome = %outcome,
        score = score,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _entered = run_span("test-run-id").entered();
        emit_check_finished("t", Some(1.0), 3, UnitState::Scored);
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }
}
