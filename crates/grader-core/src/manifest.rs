//! TOML manifest describing a command-based grader.
//!
//! ```toml
//! [grader]
//! export_tests_after_test = true
//!
//! [rate_limit]
//! tokens = 2
//! hours = 24
//! pull_prev_run = true
//!
//! [[setup]]
//! name = "build"
//! command = ["make"]
//! timeout_secs = 120
//!
//! [[test]]
//! name = "unit tests"
//! number = "1"
//! max_score = 5
//! command = ["make", "test"]
//!
//! [[test]]
//! name = "style"
//! number = "2"
//! max_score = 2
//! [test.sub_tests]
//! mode = "pass_fail"
//! ratio = 0.5
//! [[test.sub_tests.tests]]
//! name = "lint"
//! command = ["make", "lint"]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::check::CheckUnit;
use crate::command::{CommandCheck, CommandStep, Scoring};
use crate::error::{GraderError, Result};
use crate::lifecycle::{LifecycleStep, StepKind, WhenToRun};
use crate::orchestrator::GraderOptions;
use crate::rate_limit::RateLimitPolicy;
use crate::registry::Registry;
use crate::report::Visibility;
use crate::subtest::{Aggregation, SubTestRunner};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraderManifest {
    #[serde(default)]
    pub grader: GraderOptions,

    #[serde(default)]
    pub rate_limit: RateLimitPolicy,

    #[serde(default)]
    pub setup: Vec<StepSpec>,

    #[serde(default)]
    pub teardown: Vec<StepSpec>,

    #[serde(default)]
    pub test: Vec<TestSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub when: WhenToRun,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSpec {
    pub name: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub scoring: Scoring,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub kill_on_error: bool,
    #[serde(default)]
    pub do_not_set_score: bool,
    #[serde(default = "default_true")]
    pub ceil: bool,
    #[serde(default = "default_true")]
    pub floor: bool,
    #[serde(default = "default_true")]
    pub show_output: bool,
    #[serde(default)]
    pub sub_tests: Option<SubTestsSpec>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    #[default]
    PassFail,
    Weighted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubTestsSpec {
    #[serde(default)]
    pub mode: AggregationMode,
    /// Pass ratio for `pass_fail` mode; defaults to 1.
    #[serde(default)]
    pub ratio: Option<f64>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

fn default_true() -> bool {
    true
}

impl SubTestsSpec {
    pub fn aggregation(&self) -> Aggregation {
        match self.mode {
            AggregationMode::PassFail => Aggregation::PassFail {
                ratio: self.ratio.unwrap_or(1.0),
            },
            AggregationMode::Weighted => Aggregation::Weighted,
        }
    }
}

impl GraderManifest {
    /// Parse and validate a manifest.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let manifest: GraderManifest = toml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GraderError::io(path.display().to_string(), e))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        for step in self.setup.iter().chain(self.teardown.iter()) {
            if step.command.is_empty() {
                return Err(GraderError::InvalidManifest(format!(
                    "step {} has an empty command",
                    step.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for test in &self.test {
            if !seen.insert(test.name.as_str()) {
                return Err(GraderError::InvalidManifest(format!(
                    "duplicate test name: {}",
                    test.name
                )));
            }
            validate_test(test)?;
        }

        self.rate_limit.validate()
    }

    /// Build the registry of command checks and steps.
    pub fn registry(&self) -> Registry {
        let mut registry = Registry::new();
        for spec in &self.setup {
            registry.add_step(build_step(StepKind::Setup, spec));
        }
        for spec in &self.teardown {
            registry.add_step(build_step(StepKind::Teardown, spec));
        }
        for spec in &self.test {
            registry.add_test(build_unit(spec));
        }
        registry
    }
}

fn validate_test(test: &TestSpec) -> Result<()> {
    if let Some(max) = test.max_score {
        if max < 0.0 || !max.is_finite() {
            return Err(GraderError::InvalidManifest(format!(
                "test {} has invalid max score {}",
                test.name, max
            )));
        }
    }
    match (&test.command, &test.sub_tests) {
        (Some(_), Some(_)) => {
            return Err(GraderError::InvalidManifest(format!(
                "test {} has both a command and sub tests",
                test.name
            )))
        }
        (Some(command), None) if command.is_empty() => {
            return Err(GraderError::InvalidManifest(format!(
                "test {} has an empty command",
                test.name
            )))
        }
        _ => {}
    }
    if let Some(sub) = &test.sub_tests {
        if let Some(ratio) = sub.ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(GraderError::InvalidManifest(format!(
                    "test {} has pass ratio {} outside (0, 1]",
                    test.name, ratio
                )));
            }
        }
        for child in &sub.tests {
            validate_test(child)?;
        }
    }
    Ok(())
}

fn build_step(kind: StepKind, spec: &StepSpec) -> LifecycleStep {
    let mut step = LifecycleStep::new(
        kind,
        spec.name.clone(),
        Arc::new(CommandStep::new(spec.command.clone())),
    )
    .with_when(spec.when);
    if let Some(secs) = spec.timeout_secs {
        step = step.with_timeout(Duration::from_secs(secs));
    }
    step
}

fn build_unit(spec: &TestSpec) -> CheckUnit {
    let mut unit = CheckUnit::new(spec.name.clone()).with_clamps(spec.ceil, spec.floor);
    unit.number = spec.number.clone();
    unit.max_score = spec.max_score;
    unit.timeout = spec.timeout_secs.map(Duration::from_secs);
    unit.visibility = spec.visibility;
    unit.tags = spec.tags.clone();
    unit.kill_on_error = spec.kill_on_error;
    unit.do_not_set_score = spec.do_not_set_score;

    if let Some(command) = &spec.command {
        let mut check = CommandCheck::new(command.clone()).with_scoring(spec.scoring);
        check.show_output = spec.show_output;
        unit = unit.with_check(Arc::new(check));
    }
    if let Some(sub) = &spec.sub_tests {
        let mut runner = SubTestRunner::new(sub.aggregation());
        for child in &sub.tests {
            runner.add(build_unit(child));
        }
        unit = unit.with_sub_tests(runner);
    }
    unit
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[grader]
reverse_tests = true

[rate_limit]
tokens = 2
hours = 24

[[setup]]
name = "build"
command = ["make"]
timeout_secs = 30
when = "platform"

[[test]]
name = "unit"
number = "1"
max_score = 5
command = ["make", "test"]
scoring = "stdout_score"

[[test]]
name = "parts"
number = "2"
max_score = 2
[test.sub_tests]
mode = "weighted"
[[test.sub_tests.tests]]
name = "part a"
max_score = 1
command = ["true"]
"#;

    #[test]
    fn test_parse_sample() {
        let manifest = GraderManifest::from_toml_str(SAMPLE).unwrap();
        assert!(manifest.grader.reverse_tests);
        assert!(manifest.grader.export_tests_after_test);
        assert_eq!(manifest.rate_limit.budget(), Some(2));
        assert_eq!(manifest.setup[0].when, WhenToRun::Platform);
        assert_eq!(manifest.test[0].scoring, Scoring::StdoutScore);
        assert!(manifest.test[0].ceil);

        let sub = manifest.test[1].sub_tests.as_ref().unwrap();
        assert_eq!(sub.aggregation(), Aggregation::Weighted);
        assert_eq!(sub.tests.len(), 1);
    }

    #[test]
    fn test_registry_from_manifest() {
        let manifest = GraderManifest::from_toml_str(SAMPLE).unwrap();
        let registry = manifest.registry();
        assert_eq!(registry.setups().len(), 1);
        assert_eq!(registry.units().len(), 2);
        assert_eq!(registry.check_names(), vec!["unit", "parts", "part a"]);
        assert!(registry.units()[0].has_check());
        assert_eq!(
            registry.units()[1].sub_tests().unwrap().aggregation,
            Aggregation::Weighted
        );
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_command() {
        let raw = r#"
[[test]]
name = "x"
command = []
"#;
        assert!(matches!(
            GraderManifest::from_toml_str(raw),
            Err(GraderError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let raw = r#"
[[test]]
name = "x"
command = ["true"]

[[test]]
name = "x"
command = ["true"]
"#;
        assert!(GraderManifest::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let raw = r#"
[[test]]
name = "x"
[test.sub_tests]
ratio = 1.5
"#;
        assert!(GraderManifest::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            GraderManifest::from_toml_str("[[test]\nname ="),
            Err(GraderError::ManifestParse(_))
        ));
    }
}
