//! Submission metadata and prior-submission history.
//!
//! The metadata file is written by the grading platform before the grader
//! starts; this crate only reads it.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{GraderError, Result};
use crate::report::{LeaderboardEntry, TestRecord};

/// Submission id used when running locally without a metadata file.
pub const LOCAL_SUBMISSION_ID: &str = "LOCAL";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Length of the fractional-seconds-plus-offset suffix on platform
/// timestamps (`.123456-08:00`).
const TIMESTAMP_SUFFIX_LEN: usize = 13;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubmissionMetadata {
    #[serde(default)]
    pub id: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default)]
    pub previous_submissions: Vec<PreviousSubmission>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// One earlier submission as recorded by the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreviousSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_time: Option<String>,

    /// Platform score; may be a number or a numeric string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Value>,

    /// The results blob that submission produced, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

/// What a throttled run reuses from the most recent prior submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviousRun {
    pub tests: Vec<TestRecord>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub score: f64,
}

impl SubmissionMetadata {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GraderError::io(path.display().to_string(), e))?;
        let metadata = serde_json::from_str(&raw)?;
        Ok(metadata)
    }

    /// Load the metadata file; a missing file is only acceptable locally.
    pub async fn load_for(path: &Path, is_local: bool) -> Result<Option<Self>> {
        if is_local && !path.exists() {
            return Ok(None);
        }
        if !path.exists() {
            return Err(GraderError::Metadata(format!(
                "submission metadata not found at {}",
                path.display()
            )));
        }
        Self::load(path).await.map(Some)
    }

    /// The submission id as a plain string.
    pub fn id_string(&self) -> String {
        value_as_id(&self.id).unwrap_or_else(|| LOCAL_SUBMISSION_ID.to_string())
    }

    /// Creation time of this submission, if present and parsable.
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.created_at.as_deref().and_then(|s| parse_timestamp(s).ok())
    }

    /// Most recent prior submission, by submission time.
    ///
    /// Entries with unparsable times lose to parsable ones; among equals the
    /// later entry in the list wins.
    pub fn latest_previous(&self) -> Option<&PreviousSubmission> {
        self.previous_submissions
            .iter()
            .enumerate()
            .max_by_key(|(i, p)| (p.submitted_at(), *i))
            .map(|(_, p)| p)
    }

    /// Results of the most recent prior submission, for replay.
    pub fn previous_run(&self) -> Option<PreviousRun> {
        self.latest_previous().map(PreviousSubmission::replay)
    }
}

impl PreviousSubmission {
    pub fn submitted_at(&self) -> Option<NaiveDateTime> {
        self.submission_time
            .as_deref()
            .and_then(|s| parse_timestamp(s).ok())
    }

    /// `results.extra_data`, if the stored results are well-formed.
    pub fn extra_data(&self) -> Option<&Map<String, Value>> {
        self.results
            .as_ref()?
            .as_object()?
            .get("extra_data")?
            .as_object()
    }

    /// Score of this submission: results score, else entry score, else 0.
    pub fn effective_score(&self) -> f64 {
        let from_results = self
            .results
            .as_ref()
            .and_then(|r| r.get("score"))
            .and_then(value_as_f64);
        from_results
            .or_else(|| self.score.as_ref().and_then(value_as_f64))
            .unwrap_or(0.0)
    }

    /// The tests, leaderboard and score this submission reported.
    ///
    /// Records are taken one at a time. A test record whose fields do not
    /// fit [`TestRecord`] is kept with its fields untyped, so it is written
    /// back as it was stored.
    pub fn replay(&self) -> PreviousRun {
        let results = self.results.as_ref();
        let tests: Vec<TestRecord> = replay_list(results.and_then(|r| r.get("tests")), "tests", |item| {
            serde_json::from_value(item.clone()).or_else(|err| match item.as_object() {
                Some(fields) => {
                    debug!(error = %err, "keeping previous test record untyped");
                    Ok(untyped_record(fields.clone()))
                }
                None => Err(err),
            })
        });
        let leaderboard: Vec<LeaderboardEntry> = replay_list(
            results.and_then(|r| r.get("leaderboard")),
            "leaderboard",
            |item| serde_json::from_value(item.clone()),
        );
        PreviousRun {
            tests,
            leaderboard,
            score: self.effective_score(),
        }
    }
}

fn replay_list<T>(
    raw: Option<&Value>,
    key: &str,
    parse: impl Fn(&Value) -> serde_json::Result<T>,
) -> Vec<T> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let Some(items) = raw.as_array() else {
        warn!(key, "previous results entry is not a list; nothing to replay");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match parse(item) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, error = %err, "dropping malformed previous results entry");
                None
            }
        })
        .collect()
}

fn untyped_record(mut fields: Map<String, Value>) -> TestRecord {
    let output = match fields.remove("output") {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    TestRecord {
        output,
        other: fields,
        ..TestRecord::default()
    }
}

/// Parse a platform timestamp.
///
/// The trailing fractional seconds and UTC offset are dropped and the rest
/// read as `%Y-%m-%dT%H:%M:%S`; RFC 3339 and the bare format are accepted
/// as fallbacks.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if raw.len() > TIMESTAMP_SUFFIX_LEN && raw.is_char_boundary(raw.len() - TIMESTAMP_SUFFIX_LEN) {
        let head = &raw[..raw.len() - TIMESTAMP_SUFFIX_LEN];
        if let Ok(ts) = NaiveDateTime::parse_from_str(head, TIMESTAMP_FORMAT) {
            return Ok(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.naive_local());
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|_| GraderError::InvalidTimestamp(raw.to_string()))
}

/// Id values are strings or numbers on the platform.
pub(crate) fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
