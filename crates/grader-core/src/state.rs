//! Run-wide mutable state handed to check and step callbacks.

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::report::{Leaderboard, Visibility};

/// State owned by the orchestrator for the duration of one run.
///
/// Callbacks receive it by `&mut`, one at a time; nothing runs
/// concurrently, so no locking is involved.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Text shown at the top of the results page.
    pub output: Option<String>,

    /// Explicit overall score. When `None` the unit scores are summed.
    pub score: Option<f64>,

    pub visibility: Option<Visibility>,

    pub stdout_visibility: Option<Visibility>,

    /// Engine metadata (`id`, `sub_counts`, ...) plus anything checks add.
    pub extra_data: Map<String, Value>,

    pub leaderboard: Leaderboard,

    /// `true` when running on a developer machine rather than the platform.
    pub is_local: bool,

    /// Directory holding the submission under test.
    pub submission_dir: PathBuf,
}

impl RunState {
    pub fn new(is_local: bool, submission_dir: PathBuf) -> Self {
        Self {
            is_local,
            submission_dir,
            ..Self::default()
        }
    }

    /// Append a line to the run-level output.
    pub fn print(&mut self, msg: impl AsRef<str>) {
        let output = self.output.get_or_insert_with(String::new);
        output.push_str(msg.as_ref());
        output.push('\n');
    }

    /// Prepend text to the run-level output.
    pub fn prepend_output(&mut self, text: &str) {
        let output = self.output.get_or_insert_with(String::new);
        output.insert_str(0, text);
    }

    pub fn set_score(&mut self, score: f64) {
        self.score = Some(score);
    }

    /// Add to the explicit overall score, starting from zero.
    pub fn add_score(&mut self, addition: f64) {
        *self.score.get_or_insert(0.0) += addition;
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra_data.insert(key.into(), value);
    }
}
