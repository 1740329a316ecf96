//! Check units: one scored, independently guarded check.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::guard::{guarded, Guarded};
use crate::obs::emit_check_finished;
use crate::report::{TestRecord, Visibility};
use crate::safe::{self, HardFailure};
use crate::score::{clamp_score, ScoreOutcome};
use crate::state::RunState;
use crate::subtest::{StopRunner, SubTestRunner};

pub const NO_CALLABLE_MESSAGE: &str = "[Error]: No callable attached to this test!";
pub const TIMEOUT_MESSAGE: &str = "[Error]: This test timed out!";
pub const FAULT_MESSAGE: &str = "[Error]: An unexpected error occurred in the grader when \
     attempting to run this test case! Please contact a course staff member if this persists.";

/// What a check callback gets to work with.
pub struct CheckContext<'c> {
    /// Run-wide state (overall output, leaderboard, extra data, ...).
    pub run: &'c mut RunState,
    /// The unit being executed.
    pub unit: &'c mut CheckUnit,
}

impl CheckContext<'_> {
    /// Append a line to the unit's output.
    pub fn print(&mut self, msg: impl AsRef<str>) {
        self.unit.print(msg);
    }
}

/// A check body.
#[async_trait]
pub trait Check: Send + Sync {
    async fn check(&self, ctx: CheckContext<'_>) -> anyhow::Result<ScoreOutcome>;
}

/// Adapter for async closures returning a boxed future.
pub struct FnCheck<F>(F);

#[async_trait]
impl<F> Check for FnCheck<F>
where
    F: for<'c> Fn(CheckContext<'c>) -> BoxFuture<'c, anyhow::Result<ScoreOutcome>> + Send + Sync,
{
    async fn check(&self, ctx: CheckContext<'_>) -> anyhow::Result<ScoreOutcome> {
        (self.0)(ctx).await
    }
}

/// Adapter for synchronous closures.
///
/// A synchronous body cannot be interrupted by the unit's timeout.
pub struct SyncCheck<F>(F);

#[async_trait]
impl<F> Check for SyncCheck<F>
where
    F: Fn(CheckContext<'_>) -> anyhow::Result<ScoreOutcome> + Send + Sync,
{
    async fn check(&self, ctx: CheckContext<'_>) -> anyhow::Result<ScoreOutcome> {
        (self.0)(ctx)
    }
}

/// Wrap an async closure as a check.
///
/// ```ignore
/// let c = check_fn(|mut ctx| Box::pin(async move {
///     ctx.print("looks good");
///     Ok(ScoreOutcome::Pass)
/// }));
/// ```
pub fn check_fn<F>(f: F) -> Arc<dyn Check>
where
    F: for<'c> Fn(CheckContext<'c>) -> BoxFuture<'c, anyhow::Result<ScoreOutcome>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnCheck(f))
}

/// Wrap a synchronous closure as a check.
pub fn sync_check<F>(f: F) -> Arc<dyn Check>
where
    F: Fn(CheckContext<'_>) -> anyhow::Result<ScoreOutcome> + Send + Sync + 'static,
{
    Arc::new(SyncCheck(f))
}

/// Execution state of a check unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Scored,
    TimedOut,
    Faulted,
    Reported,
}

/// How a unit's execution ended, as seen by its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The unit finished (possibly scored zero after a timeout or fault).
    Completed,
    /// The unit asked the enclosing sub-test runner to stop.
    Stopped(StopRunner),
}

/// One scored unit of work.
#[derive(Clone)]
pub struct CheckUnit {
    pub name: Option<String>,

    /// Sortable ordering label (e.g. `"1.2"`).
    pub number: Option<String>,

    pub max_score: Option<f64>,

    /// Clamp scores above `max_score` down to it.
    pub ceil: bool,

    /// Clamp negative scores up to zero.
    pub floor: bool,

    pub timeout: Option<Duration>,

    pub visibility: Option<Visibility>,

    pub tags: Option<Vec<String>>,

    pub extra_data: Option<Value>,

    /// Never assign a score automatically; the body sets it itself.
    pub do_not_set_score: bool,

    /// Escalate any fault in this unit to a hard failure of the run.
    pub kill_on_error: bool,

    check: Option<Arc<dyn Check>>,
    sub_tests: Option<SubTestRunner>,
    output: String,
    score: Option<f64>,
    verdict: Option<bool>,
    has_run: bool,
    state: UnitState,
}

impl fmt::Debug for CheckUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckUnit")
            .field("name", &self.name)
            .field("number", &self.number)
            .field("max_score", &self.max_score)
            .field("score", &self.score)
            .field("state", &self.state)
            .field("has_check", &self.check.is_some())
            .field("sub_tests", &self.sub_tests.as_ref().map(|r| r.children().len()))
            .finish_non_exhaustive()
    }
}

impl Default for CheckUnit {
    fn default() -> Self {
        Self {
            name: None,
            number: None,
            max_score: None,
            ceil: true,
            floor: true,
            timeout: None,
            visibility: None,
            tags: None,
            extra_data: None,
            do_not_set_score: false,
            kill_on_error: false,
            check: None,
            sub_tests: None,
            output: String::new(),
            score: None,
            verdict: None,
            has_run: false,
            state: UnitState::Pending,
        }
    }
}

impl CheckUnit {
    /// Create a named unit with no body attached yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_check(mut self, check: Arc<dyn Check>) -> Self {
        self.check = Some(check);
        self
    }

    pub fn with_max_score(mut self, max_score: f64) -> Self {
        self.max_score = Some(max_score);
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn with_extra_data(mut self, extra_data: Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }

    /// Set both clamp flags.
    pub fn with_clamps(mut self, ceil: bool, floor: bool) -> Self {
        self.ceil = ceil;
        self.floor = floor;
        self
    }

    pub fn do_not_set_score(mut self) -> Self {
        self.do_not_set_score = true;
        self
    }

    pub fn kill_on_error(mut self) -> Self {
        self.kill_on_error = true;
        self
    }

    /// Turn this unit into a container of sub-tests run by `runner`.
    pub fn with_sub_tests(mut self, runner: SubTestRunner) -> Self {
        self.sub_tests = Some(runner);
        self
    }

    /// Register a child unit, creating a default pass/fail runner if needed.
    pub fn add_sub_test(&mut self, child: CheckUnit) {
        self.sub_tests
            .get_or_insert_with(SubTestRunner::default)
            .add(child);
    }

    pub fn has_check(&self) -> bool {
        self.check.is_some()
    }

    pub fn sub_tests(&self) -> Option<&SubTestRunner> {
        self.sub_tests.as_ref()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// Append a line to this unit's output.
    pub fn print(&mut self, msg: impl AsRef<str>) {
        self.output.push_str(msg.as_ref());
        self.output.push('\n');
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Assign a score, clamped by this unit's flags.
    pub fn set_score(&mut self, score: f64) {
        self.score = Some(clamp_score(score, self.max_score, self.ceil, self.floor));
    }

    /// Normalise a callback's outcome into this unit's score.
    pub fn apply_outcome(&mut self, outcome: ScoreOutcome) {
        if self.do_not_set_score {
            return;
        }
        if let Some(verdict) = outcome.verdict() {
            self.verdict = Some(verdict);
        }
        match outcome {
            ScoreOutcome::Numeric(value) => self.set_score(value),
            ScoreOutcome::Max | ScoreOutcome::Pass => match self.max_score {
                Some(max) => self.set_score(max),
                None => warn!(
                    test = %self.display_name(),
                    "full marks requested but the test has no max score"
                ),
            },
            ScoreOutcome::Fail => self.set_score(0.0),
            ScoreOutcome::Unset => {}
        }
    }

    /// Pass/fail view: an explicit pass verdict, or a full score.
    pub fn passed(&self) -> bool {
        if self.verdict == Some(true) {
            return true;
        }
        match (self.score, self.max_score) {
            (Some(score), Some(max)) => score == max,
            _ => false,
        }
    }

    /// Score used when folding this unit into a parent: unset counts as 0.
    pub fn aggregate_score(&self) -> f64 {
        match (self.score, self.verdict) {
            (Some(score), _) => score,
            (None, Some(true)) => self.max_score.unwrap_or(0.0),
            (None, _) => 0.0,
        }
    }

    fn auto_score(&mut self, score: f64) {
        if !self.do_not_set_score {
            self.set_score(score);
        }
    }

    /// Per-unit fault handler: zero the unit and carry on, unless the unit
    /// is flagged to take the run down with it.
    fn handle_fault(&mut self) -> anyhow::Result<Option<UnitOutcome>> {
        self.auto_score(0.0);
        if self.kill_on_error {
            return Ok(None);
        }
        self.print(FAULT_MESSAGE);
        Ok(Some(UnitOutcome::Completed))
    }

    /// Run this unit once against `run`.
    ///
    /// Returns `Err` only for a hard failure, which must end the run.
    pub async fn run(&mut self, run: &mut RunState) -> Result<(), HardFailure> {
        self.execute(run, false).await.map(|_| ())
    }

    /// Run the unit; with `intercept_stop` a [`StopRunner`] fault is handed
    /// back to the caller instead of being treated as a failure.
    pub(crate) fn execute<'a>(
        &'a mut self,
        run: &'a mut RunState,
        intercept_stop: bool,
    ) -> BoxFuture<'a, Result<UnitOutcome, HardFailure>> {
        Box::pin(async move {
            let started = Instant::now();
            self.has_run = true;
            self.state = UnitState::Running;

            let captured = if let Some(mut runner) = self.sub_tests.take() {
                let deadline = self.timeout;
                let result =
                    safe::capture(guarded(runner.run(&mut *self, &mut *run), deadline)).await;
                self.sub_tests = Some(runner);
                result
            } else if let Some(check) = self.check.clone() {
                let deadline = self.timeout;
                let ctx = CheckContext {
                    run: &mut *run,
                    unit: &mut *self,
                };
                safe::capture(guarded(check.check(ctx), deadline)).await
            } else {
                self.print(NO_CALLABLE_MESSAGE);
                self.score = Some(0.0);
                self.state = UnitState::Scored;
                self.finish(started);
                return Ok(UnitOutcome::Completed);
            };

            let outcome = match captured {
                Ok(Guarded::Done(outcome)) => {
                    self.apply_outcome(outcome);
                    self.state = UnitState::Scored;
                    Ok(UnitOutcome::Completed)
                }
                Ok(Guarded::TimedOut(timeout)) => {
                    debug!(test = %self.display_name(), error = %timeout, "test timed out");
                    self.print(TIMEOUT_MESSAGE);
                    self.auto_score(0.0);
                    self.state = UnitState::TimedOut;
                    Ok(UnitOutcome::Completed)
                }
                Err(fault) => {
                    self.state = UnitState::Faulted;
                    if let Some(hard) = fault.downcast_ref::<HardFailure>() {
                        // Raised by a nested unit; it ends the run, not just this unit.
                        let hard = hard.clone();
                        self.finish(started);
                        return Err(hard);
                    }
                    let stop = if intercept_stop {
                        fault.downcast_ref::<StopRunner>().cloned()
                    } else {
                        None
                    };
                    match stop {
                        Some(stop) => {
                            debug!(test = %self.display_name(), info = %stop.info, "stop requested");
                            Ok(UnitOutcome::Stopped(stop))
                        }
                        None => safe::recover(fault, |_fault| self.handle_fault()),
                    }
                }
            };

            self.finish(started);
            outcome
        })
    }

    fn finish(&self, started: Instant) {
        emit_check_finished(
            self.display_name(),
            self.score,
            started.elapsed().as_millis() as u64,
            self.state,
        );
    }

    /// Mark a finished unit as reported.
    pub fn mark_reported(&mut self) {
        if matches!(
            self.state,
            UnitState::Scored | UnitState::TimedOut | UnitState::Faulted
        ) {
            self.state = UnitState::Reported;
        }
    }

    /// Result record for the report.
    pub fn record(&self) -> TestRecord {
        TestRecord {
            name: self.name.clone(),
            number: self.number.clone(),
            max_score: self.max_score,
            score: self.score,
            output: self.output.clone(),
            tags: self.tags.clone(),
            visibility: self.visibility,
            extra_data: self.extra_data.clone(),
            ..TestRecord::default()
        }
    }
}
