//! Results report: the JSON blob written once (or incrementally) per run.
//!
//! Optional fields are omitted rather than written as `null`; consumers of
//! the results file treat a missing `score` differently from `0`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who may see a test result (or the grader's stdout).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Hidden,
    AfterDueDate,
    AfterPublished,
    Visible,
}

/// Sort order of a leaderboard column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One leaderboard column value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
}

/// Insertion-ordered set of leaderboard entries keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Leaderboard {
    entries: Vec<LeaderboardEntry>,
}

impl Leaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry called `name`.
    ///
    /// Replacing keeps the entry's original position.
    pub fn add_item(&mut self, name: impl Into<String>, value: Value, order: Option<SortOrder>) {
        let name = name.into();
        let entry = LeaderboardEntry {
            name: name.clone(),
            value,
            order,
        };
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get_item(&self, name: &str) -> Option<&LeaderboardEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Remove the entry called `name`; returns whether it existed.
    pub fn remove_item(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn export(&self) -> Vec<LeaderboardEntry> {
        self.entries.clone()
    }
}

/// Result record of a single check unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    #[serde(default)]
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Value>,

    /// Keys this engine does not model, kept so prior results replay verbatim.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// The results blob for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    /// Wall-clock seconds since the grader started.
    pub execution_time: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_visibility: Option<Visibility>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leaderboard: Vec<LeaderboardEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestRecord>,
}

impl RunReport {
    /// Report written when the run ends in a hard failure.
    pub fn failure(message: &str, execution_time: f64, extra_data: Map<String, Value>) -> Self {
        Self {
            execution_time,
            score: Some(0.0),
            output: Some(message.to_string()),
            extra_data,
            ..Self::default()
        }
    }

    /// Sum of the scores present on the test records, if any has one.
    pub fn tests_score(&self) -> Option<f64> {
        self.tests
            .iter()
            .filter_map(|t| t.score)
            .fold(None, |acc, s| Some(acc.unwrap_or(0.0) + s))
    }

    /// Serialize to JSON with every non-ASCII character escaped.
    pub fn to_ascii_json(&self) -> serde_json::Result<String> {
        let json = serde_json::to_string(self)?;
        let mut out = String::with_capacity(json.len());
        for ch in json.chars() {
            if ch.is_ascii() {
                out.push(ch);
            } else {
                let mut buf = [0u16; 2];
                for unit in ch.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_fields_are_omitted() {
        let report = RunReport {
            execution_time: 1.5,
            tests: vec![TestRecord {
                name: Some("a".into()),
                output: String::new(),
                ..TestRecord::default()
            }],
            ..RunReport::default()
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            json!({"execution_time": 1.5, "tests": [{"name": "a", "output": ""}]})
        );
    }

    #[test]
    fn test_zero_score_is_present() {
        let record = TestRecord {
            score: Some(0.0),
            ..TestRecord::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["score"], json!(0.0));
    }

    #[test]
    fn test_unknown_test_keys_preserved() {
        let raw = json!({"name": "t", "output": "o", "score": 1.0, "status": "passed"});
        let record: TestRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.other.get("status"), Some(&json!("passed")));
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);
    }

    #[test]
    fn test_visibility_names() {
        assert_eq!(
            serde_json::to_value(Visibility::AfterDueDate).unwrap(),
            json!("after_due_date")
        );
        let v: Visibility = serde_json::from_value(json!("after_published")).unwrap();
        assert_eq!(v, Visibility::AfterPublished);
    }

    #[test]
    fn test_leaderboard_replace_keeps_position() {
        let mut board = Leaderboard::new();
        board.add_item("speed", json!(3), Some(SortOrder::Asc));
        board.add_item("size", json!(10), None);
        board.add_item("speed", json!(2), Some(SortOrder::Asc));

        let exported = board.export();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].name, "speed");
        assert_eq!(exported[0].value, json!(2));
        assert!(board.remove_item("size"));
        assert!(!board.remove_item("size"));
        assert!(board.get_item("speed").is_some());
    }

    #[test]
    fn test_tests_score_sums_present_scores() {
        let report = RunReport {
            tests: vec![
                TestRecord {
                    score: Some(2.0),
                    ..TestRecord::default()
                },
                TestRecord::default(),
                TestRecord {
                    score: Some(3.5),
                    ..TestRecord::default()
                },
            ],
            ..RunReport::default()
        };
        assert_eq!(report.tests_score(), Some(5.5));
        assert_eq!(RunReport::default().tests_score(), None);
    }

    #[test]
    fn test_ascii_json_escapes() {
        let report = RunReport {
            output: Some("[✓] PASSED".into()),
            ..RunReport::default()
        };
        let json = report.to_ascii_json().unwrap();
        assert!(json.is_ascii());
        assert!(json.contains("\\u2713"));
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.output.as_deref(), Some("[✓] PASSED"));
    }
}
