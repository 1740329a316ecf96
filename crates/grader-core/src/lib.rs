//! Grader - submission check harness
//!
//! Runs independently written checks against a student submission:
//! - Guards every check with an optional timeout and a fault handler
//! - Aggregates nested sub-tests into their parent's score
//! - Runs setup and teardown steps around the checks
//! - Rate-limits graded runs from the submission history
//! - Writes a single results report per run

pub mod check;
pub mod command;
pub mod env;
pub mod error;
pub mod guard;
pub mod history;
pub mod lifecycle;
pub mod manifest;
pub mod obs;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod report;
pub mod safe;
pub mod score;
pub mod sink;
pub mod state;
pub mod subtest;
pub mod telemetry;

// Re-export key types
pub use check::{check_fn, sync_check, Check, CheckContext, CheckUnit, UnitState};
pub use command::{CommandCheck, CommandStep, Scoring};
pub use env::Environment;
pub use error::{GraderError, Result};
pub use guard::{guard, Timeout};
pub use history::{PreviousSubmission, SubmissionMetadata};
pub use lifecycle::{step_fn, sync_step, LifecycleStep, Step, StepKind, WhenToRun};
pub use manifest::GraderManifest;
pub use orchestrator::{Autograder, GraderOptions, RunOutcome};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use registry::Registry;
pub use report::{Leaderboard, RunReport, SortOrder, TestRecord, Visibility};
pub use safe::{safe, Fault, HardFailure};
pub use score::ScoreOutcome;
pub use sink::{FileReportSink, MemoryReportSink, ReportSink};
pub use state::RunState;
pub use subtest::{Aggregation, StopRunner, SubTestHooks, SubTestRunner, SubTestTally};
