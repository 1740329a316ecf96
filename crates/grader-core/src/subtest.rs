//! Sub-test runner: folds ordered child units into their parent's score.
//!
//! A parent [`CheckUnit`] that owns a [`SubTestRunner`] runs it in place of
//! a check body, under the parent's own timeout and fault handler. Each
//! child runs like any other unit; its output is framed into the parent's
//! output and its result goes into a [`SubTestTally`]. The tally then
//! decides the parent's score, either by pass ratio or by summing points.

use std::cmp::Ordering;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::check::{CheckUnit, UnitOutcome};
use crate::score::{format_score, ScoreOutcome};
use crate::state::RunState;

pub const NO_SUB_TESTS_MESSAGE: &str = "This test should have sub tests but none exist!";
pub const STOPPED_EARLY_MESSAGE: &str = "[Warning]: This test stopped early!";
pub const PASSED_MARK: &str = "[✓] PASSED";
pub const FAILED_MARK: &str = "[X] FAILED";

/// Request to stop the enclosing sub-test runner.
///
/// A child body returns it as an error (`Err(StopRunner::new("..").into())`);
/// the runner intercepts it and stops without treating it as a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sub-test runner stopped: {info}")]
pub struct StopRunner {
    /// Printed to the parent's output when non-empty.
    pub info: String,
}

impl StopRunner {
    pub fn new(info: impl Into<String>) -> Self {
        Self { info: info.into() }
    }
}

/// Result of a runner hook.
pub type Flow = ControlFlow<StopRunner>;

/// How child results become the parent's score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Aggregation {
    /// The parent gets full marks iff at least `ratio` of the evaluated
    /// children passed, zero otherwise.
    PassFail { ratio: f64 },
    /// The parent's score is the sum of the children's scores.
    Weighted,
}

impl Default for Aggregation {
    fn default() -> Self {
        Aggregation::PassFail { ratio: 1.0 }
    }
}

/// Running totals across the children evaluated so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubTestTally {
    pub score: f64,
    pub passed: Vec<bool>,
}

impl SubTestTally {
    /// Whether the pass ratio meets `ratio`. No evaluated children fails.
    pub fn passes(&self, ratio: f64) -> bool {
        if self.passed.is_empty() {
            return false;
        }
        let passed = self.passed.iter().filter(|p| **p).count();
        passed as f64 / self.passed.len() as f64 >= ratio
    }
}

/// Extension points around the runner's phases.
///
/// Every hook defaults to doing nothing; returning `ControlFlow::Break`
/// stops the runner after the current phase.
pub trait SubTestHooks: Send + Sync {
    fn pre_test_run(&self, _parent: &mut CheckUnit, _tally: &SubTestTally) -> Flow {
        Flow::Continue(())
    }

    fn pre_subtest_run(
        &self,
        _parent: &mut CheckUnit,
        _child: &CheckUnit,
        _tally: &SubTestTally,
    ) -> Flow {
        Flow::Continue(())
    }

    fn post_subtest_run(
        &self,
        _parent: &mut CheckUnit,
        _child: &CheckUnit,
        _tally: &SubTestTally,
    ) -> Flow {
        Flow::Continue(())
    }

    /// Runs right after the parent has been scored.
    fn score_post(&self, _parent: &mut CheckUnit, _tally: &SubTestTally) -> Flow {
        Flow::Continue(())
    }

    fn post_test_run(&self, _parent: &mut CheckUnit, _tally: &SubTestTally) -> Flow {
        Flow::Continue(())
    }
}

/// Hooks that never interfere.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl SubTestHooks for DefaultHooks {}

/// Phase at which the runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PreTestRun,
    PreSubtestRun,
    RunTest,
    PostSubtestRun,
    ScorePost,
    PostTestRun,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PreTestRun => "pre_test_run",
            Phase::PreSubtestRun => "pre_subtest_run",
            Phase::RunTest => "run_test",
            Phase::PostSubtestRun => "post_subtest_run",
            Phase::ScorePost => "score_post",
            Phase::PostTestRun => "post_test_run",
        };
        f.write_str(name)
    }
}

/// Ordered children of one parent unit plus the aggregation policy.
#[derive(Clone)]
pub struct SubTestRunner {
    pub aggregation: Aggregation,
    /// Width of the separator lines framing each child.
    pub separator_count: usize,
    hooks: Arc<dyn SubTestHooks>,
    children: Vec<CheckUnit>,
}

impl fmt::Debug for SubTestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTestRunner")
            .field("aggregation", &self.aggregation)
            .field("separator_count", &self.separator_count)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl Default for SubTestRunner {
    fn default() -> Self {
        Self::new(Aggregation::default())
    }
}

impl SubTestRunner {
    pub fn new(aggregation: Aggregation) -> Self {
        Self {
            aggregation,
            separator_count: 40,
            hooks: Arc::new(DefaultHooks),
            children: Vec::new(),
        }
    }

    pub fn pass_fail(ratio: f64) -> Self {
        Self::new(Aggregation::PassFail { ratio })
    }

    pub fn weighted() -> Self {
        Self::new(Aggregation::Weighted)
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SubTestHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_separator_count(mut self, count: usize) -> Self {
        self.separator_count = count;
        self
    }

    pub fn add(&mut self, child: CheckUnit) {
        self.children.push(child);
    }

    pub fn with_sub_test(mut self, child: CheckUnit) -> Self {
        self.add(child);
        self
    }

    pub fn children(&self) -> &[CheckUnit] {
        &self.children
    }

    /// Run every child in natural order of its number and score `parent`.
    ///
    /// The parent is scored here, so the returned outcome is always
    /// [`ScoreOutcome::Unset`]. An `Err` is a fault of the parent (or a hard
    /// failure raised by a child, carried as the error value).
    pub(crate) async fn run(
        &mut self,
        parent: &mut CheckUnit,
        state: &mut RunState,
    ) -> anyhow::Result<ScoreOutcome> {
        if self.children.is_empty() {
            anyhow::bail!(NO_SUB_TESTS_MESSAGE);
        }
        self.children
            .sort_by(|a, b| compare_numbers(a.number.as_deref(), b.number.as_deref()));

        let hooks = Arc::clone(&self.hooks);
        let sep = self.separator_count;
        let aggregation = self.aggregation;
        let mut tally = SubTestTally::default();

        let mut stop = stopped(Phase::PreTestRun, hooks.pre_test_run(parent, &tally));

        if stop.is_none() {
            for child in self.children.iter_mut() {
                if let ControlFlow::Break(s) = hooks.pre_subtest_run(parent, child, &tally) {
                    stop = Some((Phase::PreSubtestRun, s));
                    break;
                }

                parent.print("=".repeat(sep));
                parent.print(format!("[SubTest]: {}", child.display_name()));
                parent.print("-".repeat(sep));

                if let UnitOutcome::Stopped(s) = child.execute(state, true).await? {
                    if !s.info.is_empty() {
                        parent.print(&s.info);
                    }
                    stop = Some((Phase::RunTest, s));
                    break;
                }

                let passed = child.passed();
                let score = child.aggregate_score();
                tally.score += score;
                tally.passed.push(passed);

                let output = child.output().trim_end_matches('\n');
                if !output.is_empty() {
                    parent.print(output);
                }
                parent.print("-".repeat(sep));
                match aggregation {
                    Aggregation::PassFail { .. } => {
                        parent.print(if passed { PASSED_MARK } else { FAILED_MARK })
                    }
                    Aggregation::Weighted => {
                        parent.print(format!("{} / {}", format_score(score), max_label(child)))
                    }
                }
                parent.print("_".repeat(sep));
                parent.print("");

                if let ControlFlow::Break(s) = hooks.post_subtest_run(parent, child, &tally) {
                    stop = Some((Phase::PostSubtestRun, s));
                    break;
                }
            }
        }

        score_parent(parent, aggregation, &tally, sep);

        if stop.is_none() {
            stop = stopped(Phase::ScorePost, hooks.score_post(parent, &tally));
        }
        if stop.is_none() {
            stop = stopped(Phase::PostTestRun, hooks.post_test_run(parent, &tally));
        }

        if let Some((phase, s)) = stop {
            parent.print(STOPPED_EARLY_MESSAGE);
            warn!(
                test = %parent.display_name(),
                phase = %phase,
                info = %s.info,
                "sub-test runner stopped early"
            );
        }

        debug!(
            test = %parent.display_name(),
            evaluated = tally.passed.len(),
            total = tally.score,
            "sub-tests aggregated"
        );
        Ok(ScoreOutcome::Unset)
    }
}

fn stopped(phase: Phase, flow: Flow) -> Option<(Phase, StopRunner)> {
    match flow {
        ControlFlow::Break(stop) => Some((phase, stop)),
        ControlFlow::Continue(()) => None,
    }
}

fn max_label(unit: &CheckUnit) -> String {
    unit.max_score
        .map(format_score)
        .unwrap_or_else(|| "-".to_string())
}

fn score_parent(parent: &mut CheckUnit, aggregation: Aggregation, tally: &SubTestTally, sep: usize) {
    parent.print("");
    parent.print("+".repeat(sep));
    match aggregation {
        Aggregation::PassFail { ratio } => {
            let passed = tally.passes(ratio);
            parent.apply_outcome(ScoreOutcome::from(passed));
            parent.print(if passed { PASSED_MARK } else { FAILED_MARK });
        }
        Aggregation::Weighted => {
            parent.apply_outcome(ScoreOutcome::Numeric(tally.score));
            let shown = parent.score().unwrap_or(tally.score);
            parent.print(format!("{} / {}", format_score(shown), max_label(parent)));
        }
    }
    parent.print("+".repeat(sep));
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Number(&'a str),
    Text(&'a str),
}

/// Split a version-like label into digit runs and text runs, dropping dots.
fn tokenize(label: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut chars = label.char_indices().peekable();
    while let Some((start, ch)) = chars.next() {
        if ch == '.' {
            continue;
        }
        let digit = ch.is_ascii_digit();
        let mut end = start + ch.len_utf8();
        while let Some(&(i, next)) = chars.peek() {
            if next == '.' || next.is_ascii_digit() != digit {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }
        let run = &label[start..end];
        tokens.push(if digit {
            Token::Number(run)
        } else {
            Token::Text(run)
        });
    }
    tokens
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Natural ordering of labels: `"2" < "10"`, `"1.2" < "1.10"`.
///
/// Numeric runs compare by value and sort before text runs.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = tokenize(a);
    let right = tokenize(b);
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l, r) {
            (Token::Number(x), Token::Number(y)) => cmp_digits(x, y),
            (Token::Text(x), Token::Text(y)) => x.cmp(y),
            (Token::Number(_), Token::Text(_)) => Ordering::Less,
            (Token::Text(_), Token::Number(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Order optional numbers naturally, absent ones last.
pub fn compare_numbers(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => natural_cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::sync_check;

    #[test]
    fn test_natural_cmp_numbers() {
        assert_eq!(natural_cmp("2", "10"), Ordering::Less);
        assert_eq!(natural_cmp("1.2", "1.10"), Ordering::Less);
        assert_eq!(natural_cmp("1.10", "1.10"), Ordering::Equal);
        assert_eq!(natural_cmp("01", "1"), Ordering::Equal);
        assert_eq!(natural_cmp("1", "1.1"), Ordering::Less);
    }

    #[test]
    fn test_natural_cmp_text_after_numbers() {
        assert_eq!(natural_cmp("1a", "1b"), Ordering::Less);
        assert_eq!(natural_cmp("1.2", "1.b"), Ordering::Less);
    }

    #[test]
    fn test_compare_numbers_none_last() {
        let mut labels = vec![None, Some("10"), Some("2"), None, Some("1")];
        labels.sort_by(|a, b| compare_numbers(*a, *b));
        assert_eq!(labels, vec![Some("1"), Some("2"), Some("10"), None, None]);
    }

    #[test]
    fn test_tally_passes() {
        let tally = SubTestTally {
            score: 0.0,
            passed: vec![true, false],
        };
        assert!(tally.passes(0.5));
        assert!(!tally.passes(1.0));
        assert!(!SubTestTally::default().passes(0.0));
    }

    #[tokio::test]
    async fn test_empty_runner_faults_parent() {
        let mut parent = CheckUnit::new("parent")
            .with_max_score(2.0)
            .with_sub_tests(SubTestRunner::default());
        parent.run(&mut RunState::default()).await.unwrap();

        assert_eq!(parent.score(), Some(0.0));
        assert!(parent.output().contains(crate::check::FAULT_MESSAGE));
    }

    #[tokio::test]
    async fn test_child_output_is_framed() {
        let mut parent = CheckUnit::new("parent").with_max_score(1.0);
        parent.add_sub_test(
            CheckUnit::new("child")
                .with_max_score(1.0)
                .with_check(sync_check(|mut ctx| {
                    ctx.print("child says hi");
                    Ok(true.into())
                })),
        );
        parent.run(&mut RunState::default()).await.unwrap();

        let out = parent.output();
        assert!(out.contains(&"=".repeat(40)));
        assert!(out.contains("[SubTest]: child"));
        assert!(out.contains("child says hi"));
        assert!(out.contains(&"+".repeat(40)));
        assert!(out.contains(PASSED_MARK));
        assert_eq!(parent.score(), Some(1.0));
    }

    #[tokio::test]
    async fn test_stop_from_child_ends_runner() {
        let mut runner = SubTestRunner::weighted();
        runner.add(
            CheckUnit::new("first")
                .with_number("1")
                .with_max_score(1.0)
                .with_check(sync_check(|_ctx| Ok(ScoreOutcome::Max))),
        );
        runner.add(
            CheckUnit::new("stopper")
                .with_number("2")
                .with_max_score(1.0)
                .with_check(sync_check(|_ctx| Err(StopRunner::new("enough").into()))),
        );
        runner.add(
            CheckUnit::new("never")
                .with_number("3")
                .with_max_score(1.0)
                .with_check(sync_check(|_ctx| Ok(ScoreOutcome::Max))),
        );
        let mut parent = CheckUnit::new("parent")
            .with_max_score(3.0)
            .with_sub_tests(runner);
        parent.run(&mut RunState::default()).await.unwrap();

        assert_eq!(parent.score(), Some(1.0));
        assert!(parent.output().contains("enough"));
        assert!(parent.output().contains(STOPPED_EARLY_MESSAGE));
        assert!(!parent.sub_tests().unwrap().children()[2].has_run());
    }

    #[tokio::test]
    async fn test_stopped_child_is_not_tallied() {
        let runner = SubTestRunner::pass_fail(1.0)
            .with_sub_test(
                CheckUnit::new("passes")
                    .with_number("1")
                    .with_max_score(1.0)
                    .with_check(sync_check(|_ctx| Ok(ScoreOutcome::Pass))),
            )
            .with_sub_test(
                CheckUnit::new("stopper")
                    .with_number("2")
                    .with_max_score(1.0)
                    .with_check(sync_check(|_ctx| Err(StopRunner::new("").into()))),
            );
        let mut parent = CheckUnit::new("parent")
            .with_max_score(2.0)
            .with_sub_tests(runner);
        parent.run(&mut RunState::default()).await.unwrap();

        assert_eq!(parent.score(), Some(2.0));
        let out = parent.output();
        assert!(out.contains("[SubTest]: stopper"));
        assert!(!out.contains(FAILED_MARK));
        assert_eq!(out.matches(PASSED_MARK).count(), 2);
        assert!(out.contains(STOPPED_EARLY_MESSAGE));
    }

    #[tokio::test]
    async fn test_hook_break_stops_before_children() {
        struct Halt;
        impl SubTestHooks for Halt {
            fn pre_test_run(&self, _parent: &mut CheckUnit, _tally: &SubTestTally) -> Flow {
                Flow::Break(StopRunner::new("halted"))
            }
        }

        let runner = SubTestRunner::default()
            .with_hooks(Arc::new(Halt))
            .with_sub_test(
                CheckUnit::new("child")
                    .with_max_score(1.0)
                    .with_check(sync_check(|_ctx| Ok(true.into()))),
            );
        let mut parent = CheckUnit::new("parent")
            .with_max_score(1.0)
            .with_sub_tests(runner);
        parent.run(&mut RunState::default()).await.unwrap();

        assert_eq!(parent.score(), Some(0.0));
        assert!(parent.output().contains(STOPPED_EARLY_MESSAGE));
        assert!(!parent.sub_tests().unwrap().children()[0].has_run());
    }

    #[tokio::test]
    async fn test_stop_outside_runner_is_a_fault() {
        let mut unit = CheckUnit::new("plain")
            .with_max_score(1.0)
            .with_check(sync_check(|_ctx| Err(StopRunner::new("x").into())));
        unit.run(&mut RunState::default()).await.unwrap();

        assert_eq!(unit.score(), Some(0.0));
        assert!(unit.output().contains(crate::check::FAULT_MESSAGE));
    }
}
