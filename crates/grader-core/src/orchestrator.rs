//! The grader run loop: rate-limit gate, setups, checks, teardowns, report.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use crate::error::{GraderError, Result};
use crate::history::{value_as_id, SubmissionMetadata, LOCAL_SUBMISSION_ID};
use crate::lifecycle::StepKind;
use crate::obs::{emit_hard_failure, emit_run_finished, emit_run_started, new_run_id, run_span};
use crate::rate_limit::{
    submission_counts, unset_submission, RateLimitDecision, RateLimitPolicy, RateLimiter,
    TokenUsage, REFUND_MESSAGE, REUSED_MESSAGE, SUB_COUNTS_KEY, THROTTLED_MESSAGE,
};
use crate::registry::Registry;
use crate::report::RunReport;
use crate::safe::{self, Fault, HardFailure};
use crate::sink::ReportSink;
use crate::state::RunState;

pub const NO_SCORE_MESSAGE: &str =
    "This grader does not set the main score or have any tests which give points!";

pub const MAIN_FAILURE_MESSAGE: &str = "An exception occurred in the grader's main function. \
     Please contact a course staff member to resolve this issue.";

/// `extra_data` key carrying [`Registry::digest`].
pub const GRADER_DIGEST_KEY: &str = "grader_digest";

/// Hook applied to every report before it is written.
pub type ModifyResults = Arc<dyn Fn(RunReport) -> RunReport + Send + Sync>;

/// Run-level options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GraderOptions {
    /// Run (and report) the checks in reverse registration order.
    pub reverse_tests: bool,
    /// Write a partial report after every check.
    pub export_tests_after_test: bool,
}

impl Default for GraderOptions {
    fn default() -> Self {
        Self {
            reverse_tests: false,
            export_tests_after_test: true,
        }
    }
}

/// How a run ended. Every variant carries the report that was written.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// The token budget was spent; nothing was graded.
    Throttled(RunReport),
    /// A setup or teardown step said no.
    Aborted(RunReport),
    HardFailure(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            RunOutcome::Completed(r)
            | RunOutcome::Throttled(r)
            | RunOutcome::Aborted(r)
            | RunOutcome::HardFailure(r) => r,
        }
    }

    pub fn into_report(self) -> RunReport {
        match self {
            RunOutcome::Completed(r)
            | RunOutcome::Throttled(r)
            | RunOutcome::Aborted(r)
            | RunOutcome::HardFailure(r) => r,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Throttled(_) => "throttled",
            RunOutcome::Aborted(_) => "aborted",
            RunOutcome::HardFailure(_) => "hard_failure",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Drives one grader run over a [`Registry`].
pub struct Autograder {
    registry: Registry,
    options: GraderOptions,
    rate_limiter: RateLimiter,
    sink: Arc<dyn ReportSink>,
    metadata: Option<SubmissionMetadata>,
    modify_results: Option<ModifyResults>,
    state: RunState,
    usage: Option<TokenUsage>,
    run_id: String,
    started: Instant,
    ran: bool,
    no_score_warned: bool,
}

impl fmt::Debug for Autograder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autograder")
            .field("run_id", &self.run_id)
            .field("options", &self.options)
            .field("registry", &self.registry)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Autograder {
    pub fn new(registry: Registry, sink: Arc<dyn ReportSink>) -> Self {
        let mut state = RunState::default();
        state.set_extra("id", Value::from(LOCAL_SUBMISSION_ID));
        state.set_extra(GRADER_DIGEST_KEY, Value::from(registry.digest()));
        Self {
            registry,
            options: GraderOptions::default(),
            rate_limiter: RateLimiter::default(),
            sink,
            metadata: None,
            modify_results: None,
            state,
            usage: None,
            run_id: new_run_id(),
            started: Instant::now(),
            ran: false,
            no_score_warned: false,
        }
    }

    pub fn with_options(mut self, options: GraderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limiter = RateLimiter::new(policy);
        self
    }

    /// Attach the submission metadata; its id is stamped into `extra_data`.
    pub fn with_metadata(mut self, metadata: Option<SubmissionMetadata>) -> Self {
        let id = metadata
            .as_ref()
            .map(|m| m.id.clone())
            .filter(|id| !id.is_null())
            .unwrap_or_else(|| Value::from(LOCAL_SUBMISSION_ID));
        self.state.set_extra("id", id);
        self.metadata = metadata;
        self
    }

    pub fn local(mut self, is_local: bool) -> Self {
        self.state.is_local = is_local;
        self
    }

    pub fn with_submission_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state.submission_dir = dir.into();
        self
    }

    pub fn with_modify_results<F>(mut self, f: F) -> Self
    where
        F: Fn(RunReport) -> RunReport + Send + Sync + 'static,
    {
        self.modify_results = Some(Arc::new(f));
        self
    }

    /// Stamp a value into the report's `extra_data` before the run.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.set_extra(key, value);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RunState {
        &mut self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run everything once and write the final report.
    ///
    /// `Err` means a report could not be written; every grading outcome,
    /// hard failures included, is an `Ok(RunOutcome)`.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        if self.ran {
            return Err(GraderError::InvalidConfig(
                "a grader runs exactly once".to_string(),
            ));
        }
        self.ran = true;

        let run_id = self.run_id.clone();
        self.run_inner(&run_id).instrument(run_span(&run_id)).await
    }

    async fn run_inner(&mut self, run_id: &str) -> Result<RunOutcome> {
        let submission_id = self
            .state
            .extra_data
            .get("id")
            .and_then(value_as_id)
            .unwrap_or_default();
        emit_run_started(
            run_id,
            &submission_id,
            self.state.is_local,
            self.registry.units.len(),
        );

        let outcome = match safe::capture(self.execute()).await {
            Ok(outcome) => outcome,
            Err(fault) => self.fail(fault).await?,
        };

        emit_run_finished(
            run_id,
            self.started.elapsed().as_millis() as u64,
            outcome.label(),
            outcome.report().score.unwrap_or(0.0),
        );
        Ok(outcome)
    }

    async fn execute(&mut self) -> anyhow::Result<RunOutcome> {
        match self
            .rate_limiter
            .decide(self.metadata.as_ref(), self.state.is_local)
        {
            RateLimitDecision::Throttled(usage) => {
                let report = self.throttled_report(&usage);
                self.sink.write(&report).await?;
                return Ok(RunOutcome::Throttled(report));
            }
            RateLimitDecision::Allowed(usage) => {
                self.state.set_extra(SUB_COUNTS_KEY, Value::from(1));
                self.usage = Some(usage);
            }
            RateLimitDecision::Disabled | RateLimitDecision::Skipped => {}
        }

        if !self.run_steps(StepKind::Setup).await? {
            return Ok(RunOutcome::Aborted(self.finish().await?));
        }

        let mut order: Vec<usize> = (0..self.registry.units.len()).collect();
        if self.options.reverse_tests {
            order.reverse();
        }
        for index in order {
            self.registry.units[index].run(&mut self.state).await?;
            if self.options.export_tests_after_test {
                let partial = self.build_report(false);
                self.sink.write(&partial).await?;
            }
        }

        if !self.run_steps(StepKind::Teardown).await? {
            return Ok(RunOutcome::Aborted(self.finish().await?));
        }

        Ok(RunOutcome::Completed(self.finish().await?))
    }

    /// Run the permitted steps of `kind`; `false` when one of them aborted.
    async fn run_steps(&mut self, kind: StepKind) -> std::result::Result<bool, HardFailure> {
        let is_local = self.state.is_local;
        let steps = match kind {
            StepKind::Setup => &self.registry.setups,
            StepKind::Teardown => &self.registry.teardowns,
        };
        for step in steps {
            if !step.when.okay_to_run(is_local) {
                debug!(step = %step.name, kind = %kind, "step not permitted here, skipping");
                continue;
            }
            if !step.run(&mut self.state).await? {
                warn!(step = %step.name, kind = %kind, "step failed, aborting run");
                self.state.set_score(0.0);
                self.state
                    .print(format!("[Error]: An error occurred in the {} of the grader!", kind));
                if submission_counts(&self.state) {
                    self.state.print(REFUND_MESSAGE);
                    unset_submission(&mut self.state);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Prepend the rate-limit summary and write the final report.
    async fn finish(&mut self) -> anyhow::Result<RunReport> {
        if let Some(usage) = &self.usage {
            let summary = usage.summary(submission_counts(&self.state));
            self.state.prepend_output(&summary);
        }
        let report = self.generate_results();
        self.sink.write(&report).await?;
        Ok(report)
    }

    /// Assemble the final report from the current state.
    ///
    /// Safe to call repeatedly: `tests` and `score` do not change between
    /// calls unless a unit runs in between.
    pub fn generate_results(&mut self) -> RunReport {
        self.build_report(true)
    }

    fn build_report(&mut self, final_report: bool) -> RunReport {
        let mut tests = Vec::new();
        let count = self.registry.units.len();
        for i in 0..count {
            let index = if self.options.reverse_tests {
                count - 1 - i
            } else {
                i
            };
            let unit = &mut self.registry.units[index];
            if !unit.has_run() {
                continue;
            }
            if final_report {
                unit.mark_reported();
            }
            tests.push(unit.record());
        }

        let mut report = RunReport {
            execution_time: self.started.elapsed().as_secs_f64(),
            tests,
            ..RunReport::default()
        };

        report.score = match self.state.score {
            Some(score) => Some(score),
            None => match report.tests_score() {
                Some(score) => Some(score),
                None => {
                    if final_report && !self.no_score_warned {
                        self.no_score_warned = true;
                        self.state.print(NO_SCORE_MESSAGE);
                    }
                    Some(0.0)
                }
            },
        };

        report.output = self.state.output.clone();
        report.visibility = self.state.visibility;
        report.stdout_visibility = self.state.stdout_visibility;
        report.extra_data = self.state.extra_data.clone();
        report.leaderboard = self.state.leaderboard.export();
        self.apply_modifier(report)
    }

    fn throttled_report(&mut self, usage: &TokenUsage) -> RunReport {
        self.state.set_extra(SUB_COUNTS_KEY, Value::from(0));
        let mut output = usage.summary(false);
        output.push_str(THROTTLED_MESSAGE);
        output.push('\n');

        let mut report = RunReport {
            execution_time: self.started.elapsed().as_secs_f64(),
            score: Some(0.0),
            extra_data: self.state.extra_data.clone(),
            ..RunReport::default()
        };

        let previous = if self.rate_limiter.policy().pull_prev_run {
            self.metadata.as_ref().and_then(SubmissionMetadata::previous_run)
        } else {
            None
        };
        if let Some(previous) = previous {
            info!(score = previous.score, "reusing previous submission results");
            output.push_str(REUSED_MESSAGE);
            output.push('\n');
            report.tests = previous.tests;
            report.leaderboard = previous.leaderboard;
            report.score = Some(previous.score);
        }
        report.output = Some(output);
        self.apply_modifier(report)
    }

    fn apply_modifier(&self, report: RunReport) -> RunReport {
        match &self.modify_results {
            Some(modify) => modify(report),
            None => report,
        }
    }

    /// The main loop faulted: write the failure report.
    async fn fail(&mut self, fault: Fault) -> Result<RunOutcome> {
        let fault = match fault {
            Fault::Error(err) => match err.downcast::<GraderError>() {
                Ok(sink_error) => return Err(sink_error),
                Err(err) => Fault::Error(err),
            },
            panic => panic,
        };

        let hard = match fault.downcast_ref::<HardFailure>() {
            Some(hard) => hard.clone(),
            None => safe::recover(fault, |_fault| {
                Ok(Some(HardFailure::new(MAIN_FAILURE_MESSAGE, "grader main loop faulted")))
            })
            .unwrap_or_else(|hard| hard),
        };
        emit_hard_failure(&self.run_id, &hard);

        let report = RunReport::failure(
            &hard.message,
            self.started.elapsed().as_secs_f64(),
            self.state.extra_data.clone(),
        );
        self.sink.write(&report).await?;
        Ok(RunOutcome::HardFailure(report))
    }

    /// Write a zero-score report that carries only `message`.
    pub async fn notice(sink: &dyn ReportSink, message: &str) -> Result<RunReport> {
        let mut report = RunReport {
            score: Some(0.0),
            ..RunReport::default()
        };
        let mut output = message.to_string();
        output.push('\n');
        report.output = Some(output);
        sink.write(&report).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{sync_check, CheckUnit};
    use crate::lifecycle::{sync_step, LifecycleStep};
    use crate::score::ScoreOutcome;
    use crate::sink::MemoryReportSink;

    fn grader(registry: Registry) -> (Autograder, Arc<MemoryReportSink>) {
        let sink = Arc::new(MemoryReportSink::new());
        let ag = Autograder::new(registry, sink.clone()).local(true);
        (ag, sink)
    }

    #[tokio::test]
    async fn test_scores_are_summed() {
        let mut registry = Registry::new();
        registry
            .add_test(
                CheckUnit::new("a")
                    .with_max_score(2.0)
                    .with_check(sync_check(|_| Ok(ScoreOutcome::Max))),
            )
            .add_test(
                CheckUnit::new("b")
                    .with_max_score(3.0)
                    .with_check(sync_check(|_| Ok(ScoreOutcome::Numeric(1.5)))),
            );
        let (mut ag, sink) = grader(registry);

        let outcome = ag.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(outcome.report().score, Some(3.5));
        // Two partial reports plus the final one.
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.last().unwrap(), *outcome.report());
    }

    #[tokio::test]
    async fn test_no_score_warning_added_once() {
        let (mut ag, _sink) = grader(Registry::new());
        ag.run().await.unwrap();
        let first = ag.generate_results();
        let second = ag.generate_results();

        assert_eq!(first.score, Some(0.0));
        assert_eq!(first.output.as_deref(), Some(format!("{}\n", NO_SCORE_MESSAGE).as_str()));
        assert_eq!(second.output, first.output);
    }

    #[tokio::test]
    async fn test_explicit_score_wins() {
        let mut registry = Registry::new();
        registry.add_test(
            CheckUnit::new("a")
                .with_max_score(2.0)
                .with_check(sync_check(|ctx| {
                    ctx.run.set_score(10.0);
                    Ok(ScoreOutcome::Max)
                })),
        );
        let (mut ag, _sink) = grader(registry);
        let outcome = ag.run().await.unwrap();
        assert_eq!(outcome.report().score, Some(10.0));
    }

    #[tokio::test]
    async fn test_reverse_tests_order() {
        let mut registry = Registry::new();
        for name in ["first", "second"] {
            registry.add_test(
                CheckUnit::new(name)
                    .with_max_score(1.0)
                    .with_check(sync_check(|_| Ok(true.into()))),
            );
        }
        let (ag, _sink) = grader(registry);
        let mut ag = ag.with_options(GraderOptions {
            reverse_tests: true,
            export_tests_after_test: false,
        });
        let outcome = ag.run().await.unwrap();
        let names: Vec<_> = outcome
            .report()
            .tests
            .iter()
            .map(|t| t.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_steps_respect_when_to_run() {
        let mut registry = Registry::new();
        registry.add_step(
            LifecycleStep::setup("platform only", sync_step(|_| Ok(false)))
                .with_when(crate::lifecycle::WhenToRun::Platform),
        );
        let (mut ag, _sink) = grader(registry);
        let outcome = ag.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_teardown_failure_aborts() {
        let mut registry = Registry::new();
        registry
            .add_test(
                CheckUnit::new("a")
                    .with_max_score(1.0)
                    .with_check(sync_check(|_| Ok(true.into()))),
            )
            .add_step(LifecycleStep::teardown("cleanup", sync_step(|_| Ok(false))));
        let (mut ag, _sink) = grader(registry);
        let outcome = ag.run().await.unwrap();

        assert!(matches!(outcome, RunOutcome::Aborted(_)));
        let report = outcome.report();
        assert_eq!(report.score, Some(0.0));
        assert!(report
            .output
            .as_deref()
            .unwrap()
            .contains("An error occurred in the teardown of the grader!"));
        assert_eq!(report.tests.len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let (mut ag, _sink) = grader(Registry::new());
        ag.run().await.unwrap();
        assert!(matches!(ag.run().await, Err(GraderError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_notice_writes_message_only() {
        let sink = MemoryReportSink::new();
        let report = Autograder::notice(&sink, "grader is down").await.unwrap();
        assert_eq!(report.score, Some(0.0));
        assert_eq!(report.output.as_deref(), Some("grader is down\n"));
        assert!(report.tests.is_empty());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_modify_results_applied() {
        let (ag, sink) = grader(Registry::new());
        let mut ag = ag.with_modify_results(|mut report| {
            report.extra_data.insert("patched".into(), Value::Bool(true));
            report
        });
        ag.run().await.unwrap();
        assert_eq!(
            sink.last().unwrap().extra_data.get("patched"),
            Some(&Value::Bool(true))
        );
    }
}
