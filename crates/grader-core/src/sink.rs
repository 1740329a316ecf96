//! Report sinks: where emitted reports go.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{GraderError, Result};
use crate::report::RunReport;

/// Destination for results reports.
///
/// A run may write several times (partial reports after each check); the
/// last write is the final report.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn write(&self, report: &RunReport) -> Result<()>;
}

/// Writes the results JSON file, replacing it on every write.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    path: PathBuf,
}

impl FileReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn write(&self, report: &RunReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| GraderError::io(parent.display().to_string(), e))?;
            }
        }
        let json = report.to_ascii_json()?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| GraderError::io(self.path.display().to_string(), e))
    }
}

/// In-memory sink that keeps every written report.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    reports: Mutex<Vec<RunReport>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports written so far, oldest first.
    pub fn reports(&self) -> Vec<RunReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<RunReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn write(&self, report: &RunReport) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }
}
