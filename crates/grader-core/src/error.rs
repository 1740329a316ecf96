//! Error types for grader plumbing (files, manifests, metadata).
//!
//! Faults raised by check callbacks are not `GraderError`s: they are
//! `anyhow::Error`s captured by the safe environment (see [`crate::safe`]).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraderError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Manifest parse error: {0}")]
    ManifestParse(#[from] toml::de::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Submission metadata error: {0}")]
    Metadata(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GraderError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        GraderError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for grader plumbing operations
pub type Result<T> = std::result::Result<T, GraderError>;
