//! Registration of check units and lifecycle steps for one run.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::check::CheckUnit;
use crate::error::{GraderError, Result};
use crate::lifecycle::{LifecycleStep, StepKind};

/// Everything a run executes, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub(crate) units: Vec<CheckUnit>,
    pub(crate) setups: Vec<LifecycleStep>,
    pub(crate) teardowns: Vec<LifecycleStep>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_test(&mut self, unit: CheckUnit) -> &mut Self {
        self.units.push(unit);
        self
    }

    /// Insert a unit at `index` (clamped to the end).
    pub fn insert_test(&mut self, index: usize, unit: CheckUnit) -> &mut Self {
        let index = index.min(self.units.len());
        self.units.insert(index, unit);
        self
    }

    /// Register a step under its own kind.
    pub fn add_step(&mut self, step: LifecycleStep) -> &mut Self {
        match step.kind {
            StepKind::Setup => self.setups.push(step),
            StepKind::Teardown => self.teardowns.push(step),
        }
        self
    }

    pub fn units(&self) -> &[CheckUnit] {
        &self.units
    }

    pub fn setups(&self) -> &[LifecycleStep] {
        &self.setups
    }

    pub fn teardowns(&self) -> &[LifecycleStep] {
        &self.teardowns
    }

    /// Names of all units, parents before their children, in order.
    pub fn check_names(&self) -> Vec<String> {
        fn walk(unit: &CheckUnit, out: &mut Vec<String>) {
            out.push(unit.display_name().to_string());
            if let Some(runner) = unit.sub_tests() {
                for child in runner.children() {
                    walk(child, out);
                }
            }
        }
        let mut names = Vec::new();
        for unit in &self.units {
            walk(unit, &mut names);
        }
        names
    }

    /// SHA-256 (hex) over the ordered check names, as stamped into reports.
    pub fn digest(&self) -> String {
        compute_checks_digest(&self.check_names())
    }

    /// Reject registrations that cannot run as intended.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for unit in &self.units {
            validate_unit(unit)?;
            if let Some(name) = &unit.name {
                if !seen.insert(name.as_str()) {
                    return Err(GraderError::InvalidConfig(format!(
                        "duplicate test name: {}",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Compute deterministic digest of ordered check names.
pub fn compute_checks_digest(names: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn validate_unit(unit: &CheckUnit) -> Result<()> {
    if unit.has_check() && unit.sub_tests().is_some() {
        return Err(GraderError::InvalidConfig(format!(
            "test {} has both a check and sub tests",
            unit.display_name()
        )));
    }
    if let Some(max) = unit.max_score {
        if max < 0.0 || !max.is_finite() {
            return Err(GraderError::InvalidConfig(format!(
                "test {} has invalid max score {}",
                unit.display_name(),
                max
            )));
        }
    }
    if let Some(runner) = unit.sub_tests() {
        for child in runner.children() {
            validate_unit(child)?;
        }
    }
    Ok(())
}
