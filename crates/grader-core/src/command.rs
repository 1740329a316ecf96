//! Command-backed checks and steps.
//!
//! Each command runs as a plain child process in the submission directory.
//! The child is killed when its future is dropped, so a unit timeout also
//! stops the process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::check::{Check, CheckContext};
use crate::lifecycle::Step;
use crate::score::ScoreOutcome;
use crate::state::RunState;

/// Captured result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command` in `cwd` and capture its output.
pub async fn run_command(command: &[String], cwd: &Path) -> anyhow::Result<CommandOutput> {
    let start = Instant::now();

    let (exe, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;

    let child = Command::new(exe)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", exe))?;

    let output = child.wait_with_output().await?;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        command = %exe,
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
        "command finished"
    );
    Ok(result)
}

/// How a command's result becomes a score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    /// Exit code 0 passes, anything else fails.
    #[default]
    ExitCode,
    /// The last non-empty stdout line is the number of points.
    StdoutScore,
}

/// A check that runs an external command.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    pub command: Vec<String>,
    /// Working directory; the submission directory when unset.
    pub cwd: Option<PathBuf>,
    pub scoring: Scoring,
    /// Copy the command's stdout and stderr into the unit output.
    pub show_output: bool,
}

impl CommandCheck {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            cwd: None,
            scoring: Scoring::default(),
            show_output: true,
        }
    }

    pub fn with_scoring(mut self, scoring: Scoring) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.show_output = false;
        self
    }
}

#[async_trait]
impl Check for CommandCheck {
    async fn check(&self, mut ctx: CheckContext<'_>) -> anyhow::Result<ScoreOutcome> {
        let cwd = self
            .cwd
            .clone()
            .unwrap_or_else(|| ctx.run.submission_dir.clone());
        let output = run_command(&self.command, &cwd).await?;

        if self.show_output {
            let stdout = output.stdout.trim_end();
            if !stdout.is_empty() {
                ctx.print(stdout);
            }
            let stderr = output.stderr.trim_end();
            if !stderr.is_empty() {
                ctx.print(stderr);
            }
        }

        match self.scoring {
            Scoring::ExitCode => Ok(output.success().into()),
            Scoring::StdoutScore => parse_stdout_score(&output.stdout).map(ScoreOutcome::Numeric),
        }
    }
}

/// Parse the last non-empty line of `stdout` as a score.
pub fn parse_stdout_score(stdout: &str) -> anyhow::Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| anyhow::anyhow!("command printed no score"))?;
    line.parse::<f64>()
        .with_context(|| format!("last stdout line is not a score: {:?}", line))
}

/// A setup or teardown step that runs an external command; exit 0 continues.
#[derive(Debug, Clone)]
pub struct CommandStep {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandStep {
    pub fn new(command: Vec<String>) -> Self {
        Self { command, cwd: None }
    }
}

#[async_trait]
impl Step for CommandStep {
    async fn run(&self, state: &mut RunState) -> anyhow::Result<bool> {
        let cwd = self
            .cwd
            .clone()
            .unwrap_or_else(|| state.submission_dir.clone());
        let output = run_command(&self.command, &cwd).await?;
        if !output.success() {
            let stderr = output.stderr.trim_end();
            if !stderr.is_empty() {
                state.print(stderr);
            }
        }
        Ok(output.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stdout_score() {
        assert_eq!(parse_stdout_score("compiling\n3.5\n\n").unwrap(), 3.5);
        assert!(parse_stdout_score("").is_err());
        assert!(parse_stdout_score("all good").is_err());
    }

    #[tokio::test]
    async fn test_run_command_empty_is_error() {
        let err = run_command(&[], Path::new(".")).await.unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[tokio::test]
    async fn test_run_simple_command() {
        let out = run_command(&["echo".to_string(), "hello".to_string()], Path::new("."))
            .await
            .expect("echo failed");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }
}
