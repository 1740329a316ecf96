//! Where the grader runs and where its files live.
//!
//! On the grading platform everything sits under `/autograder`; on a
//! developer machine (`IS_LOCAL=true`) paths are relative to the working
//! directory.

use std::path::PathBuf;

/// Environment variable that marks a local run.
pub const IS_LOCAL_VAR: &str = "IS_LOCAL";

const PLATFORM_ROOT: &str = "/autograder";

/// `true` when `IS_LOCAL` is exactly `"true"`.
pub fn is_local() -> bool {
    std::env::var(IS_LOCAL_VAR).is_ok_and(|v| v == "true")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub is_local: bool,
    pub results_path: PathBuf,
    pub metadata_path: PathBuf,
    pub submission_dir: PathBuf,
}

impl Environment {
    /// Paths for the environment signalled by `IS_LOCAL`.
    pub fn detect() -> Self {
        Self::for_mode(is_local())
    }

    pub fn for_mode(is_local: bool) -> Self {
        let root = if is_local {
            PathBuf::from(".")
        } else {
            PathBuf::from(PLATFORM_ROOT)
        };
        Self {
            is_local,
            results_path: root.join("results").join("results.json"),
            metadata_path: root.join("submission_metadata.json"),
            submission_dir: root.join("submission"),
        }
    }

    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = path.into();
        self
    }

    pub fn with_metadata_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_path = path.into();
        self
    }

    pub fn with_submission_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.submission_dir = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_platform_paths() {
        let env = Environment::for_mode(false);
        assert_eq!(env.results_path, Path::new("/autograder/results/results.json"));
        assert_eq!(env.metadata_path, Path::new("/autograder/submission_metadata.json"));
        assert_eq!(env.submission_dir, Path::new("/autograder/submission"));
    }

    #[test]
    fn test_local_paths_and_overrides() {
        let env = Environment::for_mode(true).with_results_path("out.json");
        assert_eq!(env.results_path, Path::new("out.json"));
        assert_eq!(env.metadata_path, Path::new("./submission_metadata.json"));
        assert_eq!(env.submission_dir, Path::new("./submission"));
    }
}
