//! Setup and teardown steps around the check units.
//!
//! A step answers one question: may the run continue? A timeout or a
//! fault inside the step is reported in the run output and counts as "no".

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::guard::{guarded, Guarded};
use crate::obs::emit_step_finished;
use crate::safe::{self, HardFailure};
use crate::state::RunState;

/// Environments in which a step is allowed to run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WhenToRun {
    Neither,
    Local,
    Platform,
    #[default]
    Both,
}

impl WhenToRun {
    pub fn okay_to_run(self, is_local: bool) -> bool {
        match self {
            WhenToRun::Neither => false,
            WhenToRun::Both => true,
            WhenToRun::Local => is_local,
            WhenToRun::Platform => !is_local,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Setup,
    Teardown,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Setup => "setup",
            StepKind::Teardown => "teardown",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step body. `Ok(true)` lets the run continue.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, state: &mut RunState) -> anyhow::Result<bool>;
}

pub struct FnStep<F>(F);

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: for<'s> Fn(&'s mut RunState) -> BoxFuture<'s, anyhow::Result<bool>> + Send + Sync,
{
    async fn run(&self, state: &mut RunState) -> anyhow::Result<bool> {
        (self.0)(state).await
    }
}

pub struct SyncStep<F>(F);

#[async_trait]
impl<F> Step for SyncStep<F>
where
    F: Fn(&mut RunState) -> anyhow::Result<bool> + Send + Sync,
{
    async fn run(&self, state: &mut RunState) -> anyhow::Result<bool> {
        (self.0)(state)
    }
}

/// Wrap an async closure as a step.
pub fn step_fn<F>(f: F) -> Arc<dyn Step>
where
    F: for<'s> Fn(&'s mut RunState) -> BoxFuture<'s, anyhow::Result<bool>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnStep(f))
}

/// Wrap a synchronous closure as a step.
pub fn sync_step<F>(f: F) -> Arc<dyn Step>
where
    F: Fn(&mut RunState) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(SyncStep(f))
}

#[derive(Clone)]
pub struct LifecycleStep {
    pub kind: StepKind,
    pub name: String,
    pub timeout: Option<Duration>,
    pub when: WhenToRun,
    step: Arc<dyn Step>,
}

impl fmt::Debug for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleStep")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("when", &self.when)
            .finish_non_exhaustive()
    }
}

impl LifecycleStep {
    pub fn setup(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self::new(StepKind::Setup, name, step)
    }

    pub fn teardown(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self::new(StepKind::Teardown, name, step)
    }

    pub fn new(kind: StepKind, name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            kind,
            name: name.into(),
            timeout: None,
            when: WhenToRun::default(),
            step,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_when(mut self, when: WhenToRun) -> Self {
        self.when = when;
        self
    }

    /// Run the step. `Ok(false)` aborts the run; `Err` only for a hard
    /// failure.
    pub async fn run(&self, state: &mut RunState) -> Result<bool, HardFailure> {
        let started = Instant::now();
        let kind = self.kind;

        let captured = safe::capture(guarded(self.step.run(&mut *state), self.timeout)).await;
        let proceed = match captured {
            Ok(Guarded::Done(proceed)) => proceed,
            Ok(Guarded::TimedOut(timeout)) => {
                warn!(step = %self.name, kind = %kind, error = %timeout, "step timed out");
                state.print(format!("[Error]: A {} step timed out!", kind));
                false
            }
            Err(fault) => safe::recover(fault, |_fault| {
                warn!(step = %self.name, kind = %kind, "step raised an error");
                state.print(format!(
                    "[Error]: An unexpected error occurred in the grader when attempting to \
                     run a {} of the grader! Please contact a course staff member if this persists.",
                    kind
                ));
                Ok(Some(false))
            })?,
        };

        debug!(step = %self.name, kind = %kind, proceed, "step finished");
        emit_step_finished(
            kind.as_str(),
            &self.name,
            started.elapsed().as_millis() as u64,
            proceed,
        );
        Ok(proceed)
    }
}
