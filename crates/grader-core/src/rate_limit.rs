//! Rolling-window token accounting over submission history.
//!
//! A submission "uses a token" when its stored results carry a truthy
//! `extra_data.sub_counts`. Before running, the limiter counts the tokens
//! used inside the window; if the budget is spent the run is throttled and
//! does not count.
//!
//! Accounting fails toward scarcity: history entries with missing or
//! malformed results count as used, and unparsable timestamps are treated
//! as inside the window. A disabled limiter does no accounting at all.

use std::collections::HashSet;

use chrono::{Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GraderError, Result};
use crate::history::{parse_timestamp, value_as_id, PreviousSubmission, SubmissionMetadata};
use crate::obs::emit_rate_limit_decided;
use crate::state::RunState;

/// `extra_data` key recording whether this run used a token.
pub const SUB_COUNTS_KEY: &str = "sub_counts";

pub const REFUND_MESSAGE: &str =
    "[Rate Limit]: Since the grader failed to run, you will not use up a token!";

pub const THROTTLED_MESSAGE: &str =
    "[Rate Limit]: You have no tokens left, so this submission was not graded.";

pub const REUSED_MESSAGE: &str =
    "[Rate Limit]: The results below are from your most recent graded submission.";

const REGEN_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Rate limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Token budget per window. Absent or non-positive disables limiting.
    pub tokens: Option<i64>,
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
    /// Submissions at or before this instant never count.
    pub reset_time: Option<String>,
    /// When throttled, replay the most recent prior results.
    pub pull_prev_run: bool,
    /// Submission ids that never count.
    pub submission_id_exclude: Vec<String>,
    /// Apply the limit on local runs too.
    pub enforce_when_local: bool,
}

impl RateLimitPolicy {
    pub fn new(tokens: u32) -> Self {
        Self {
            tokens: Some(i64::from(tokens)),
            ..Self::default()
        }
    }

    pub fn per_seconds(mut self, seconds: u64) -> Self {
        self.seconds = seconds;
        self
    }

    pub fn per_hours(mut self, hours: u64) -> Self {
        self.hours = hours;
        self
    }

    pub fn per_days(mut self, days: u64) -> Self {
        self.days = days;
        self
    }

    pub fn with_reset_time(mut self, reset_time: impl Into<String>) -> Self {
        self.reset_time = Some(reset_time.into());
        self
    }

    pub fn pull_prev_run(mut self) -> Self {
        self.pull_prev_run = true;
        self
    }

    pub fn exclude(mut self, submission_id: impl Into<String>) -> Self {
        self.submission_id_exclude.push(submission_id.into());
        self
    }

    pub fn budget(&self) -> Option<u32> {
        match self.tokens {
            Some(n) if n > 0 => Some(u32::try_from(n).unwrap_or(u32::MAX)),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.budget().is_some()
    }

    /// Window length in seconds; `None` when the sum overflows.
    pub fn total_seconds(&self) -> Option<u64> {
        self.days
            .checked_mul(24)
            .and_then(|h| h.checked_add(self.hours))
            .and_then(|h| h.checked_mul(60))
            .and_then(|m| m.checked_add(self.minutes))
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(self.seconds))
    }

    fn checked_window(&self) -> Option<TimeDelta> {
        self.total_seconds()
            .and_then(|s| i64::try_from(s).ok())
            .and_then(TimeDelta::try_seconds)
    }

    /// The window as a duration. Unrepresentable windows saturate;
    /// [`validate`](Self::validate) rejects them up front.
    pub fn window(&self) -> TimeDelta {
        self.checked_window().unwrap_or(TimeDelta::MAX)
    }

    /// Check the reset time parses, so a typo does not silently disable it,
    /// and that the window fits in a duration.
    pub fn validate(&self) -> Result<()> {
        if let Some(reset) = &self.reset_time {
            parse_timestamp(reset)?;
        }
        let Some(window) = self.checked_window() else {
            return Err(GraderError::InvalidConfig(
                "rate limit window is too large".to_string(),
            ));
        };
        if self.is_enabled() && window == TimeDelta::zero() {
            return Err(GraderError::InvalidConfig(
                "rate limit window is zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tokens used inside the window before this submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUsage {
    pub used: u32,
    pub budget: u32,
    /// Oldest counted submission inside the window.
    pub oldest: Option<NaiveDateTime>,
    pub now: NaiveDateTime,
    pub window: TimeDelta,
}

impl TokenUsage {
    /// Summary text shown to the submitter. `counts` is whether this run
    /// ended up using a token.
    pub fn summary(&self, counts: bool) -> String {
        let used = self.used + u32::from(counts);
        let mut text = format!(
            "[Rate Limit]: You have used {} of {} tokens in the past {}.\n",
            used,
            self.budget,
            format_window(self.window)
        );
        let anchor = self.oldest.or(if counts { Some(self.now) } else { None });
        match anchor {
            Some(anchor) => match anchor.checked_add_signed(self.window) {
                Some(regen) => text.push_str(&format!(
                    "[Rate Limit]: As of this submission time, your next token will regenerate at {}.\n\n",
                    regen.format(REGEN_FORMAT)
                )),
                None => {
                    warn!(window_secs = self.window.num_seconds(), "token regeneration time out of range");
                    text.push('\n');
                }
            },
            None => text.push_str(
                "[Rate Limit]: As of this submission time, you have not used any tokens!\n\n",
            ),
        }
        text
    }
}

/// What the limiter decided for this run.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    /// No positive budget configured.
    Disabled,
    /// Local run (or no metadata) without enforcement.
    Skipped,
    /// The run proceeds and uses a token.
    Allowed(TokenUsage),
    /// The budget is spent; the run does not count.
    Throttled(TokenUsage),
}

impl RateLimitDecision {
    pub fn usage(&self) -> Option<&TokenUsage> {
        match self {
            RateLimitDecision::Allowed(usage) | RateLimitDecision::Throttled(usage) => Some(usage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    /// Decide whether this submission may run and use a token.
    pub fn decide(&self, metadata: Option<&SubmissionMetadata>, is_local: bool) -> RateLimitDecision {
        let Some(budget) = self.policy.budget() else {
            return RateLimitDecision::Disabled;
        };
        if is_local && !self.policy.enforce_when_local {
            debug!("rate limit skipped for local run");
            return RateLimitDecision::Skipped;
        }
        let Some(metadata) = metadata else {
            warn!("rate limit enabled but no submission metadata is available");
            return RateLimitDecision::Skipped;
        };

        let now = metadata.created_at().unwrap_or_else(|| {
            warn!("submission created_at missing or unparsable; using the current time");
            Local::now().naive_local()
        });
        let (used, oldest) = self.count_tokens(now, &metadata.previous_submissions);
        let usage = TokenUsage {
            used,
            budget,
            oldest,
            now,
            window: self.policy.window(),
        };

        let counts = used < budget;
        emit_rate_limit_decided(used, budget, counts);
        if counts {
            RateLimitDecision::Allowed(usage)
        } else {
            RateLimitDecision::Throttled(usage)
        }
    }

    /// Count tokens used inside the window ending at `now`.
    ///
    /// Returns the count and the oldest counted submission time.
    pub fn count_tokens(
        &self,
        now: NaiveDateTime,
        history: &[PreviousSubmission],
    ) -> (u32, Option<NaiveDateTime>) {
        let window = self.policy.window();
        let reset = self
            .policy
            .reset_time
            .as_deref()
            .and_then(|raw| match parse_timestamp(raw) {
                Ok(ts) => Some(ts),
                Err(err) => {
                    warn!(error = %err, "ignoring unparsable rate limit reset time");
                    None
                }
            });
        let excluded: HashSet<&str> = self
            .policy
            .submission_id_exclude
            .iter()
            .map(String::as_str)
            .collect();

        let mut used = 0u32;
        let mut oldest: Option<NaiveDateTime> = None;
        for entry in history {
            let at = entry.submitted_at();
            if let Some(at) = at {
                if reset.is_some_and(|reset| at <= reset) {
                    continue;
                }
                if now - at > window {
                    continue;
                }
            }
            if !entry_counts(entry, &excluded) {
                continue;
            }
            used += 1;
            if let Some(at) = at {
                oldest = Some(oldest.map_or(at, |o| o.min(at)));
            }
        }
        (used, oldest)
    }
}

/// Whether a history entry used a token. Malformed entries do.
fn entry_counts(entry: &PreviousSubmission, excluded: &HashSet<&str>) -> bool {
    let Some(extra) = entry.extra_data() else {
        return true;
    };
    if let Some(id) = extra.get("id").and_then(value_as_id) {
        if excluded.contains(id.as_str()) {
            return false;
        }
    }
    match extra.get(SUB_COUNTS_KEY) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(true, |v| v != 0.0),
        _ => true,
    }
}

/// Whether the current run is recorded as using a token.
pub fn submission_counts(state: &RunState) -> bool {
    match state.extra_data.get(SUB_COUNTS_KEY) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

/// Give the token back: the run failed before grading finished.
pub fn unset_submission(state: &mut RunState) {
    state.set_extra(SUB_COUNTS_KEY, Value::from(0));
}

/// Render a window like `1 day, 2 hours`.
pub fn format_window(window: TimeDelta) -> String {
    let mut secs = window.num_seconds().max(0);
    let mut parts = Vec::new();
    for (unit, size) in [("day", 86_400), ("hour", 3_600), ("minute", 60), ("second", 1)] {
        let n = secs / size;
        secs %= size;
        if n > 0 {
            parts.push(format!("{} {}{}", n, unit, if n == 1 { "" } else { "s" }));
        }
    }
    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    fn entry(time: &str, results: Value) -> PreviousSubmission {
        PreviousSubmission {
            submission_time: Some(time.to_string()),
            score: None,
            results: Some(results),
        }
    }

    #[test]
    fn test_policy_disabled_without_positive_budget() {
        assert!(!RateLimitPolicy::default().is_enabled());
        let zero = RateLimitPolicy {
            tokens: Some(0),
            ..RateLimitPolicy::default()
        };
        assert!(!zero.is_enabled());
        assert_eq!(
            RateLimiter::new(zero).decide(None, false),
            RateLimitDecision::Disabled
        );
    }

    #[test]
    fn test_total_seconds() {
        let policy = RateLimitPolicy {
            seconds: 1,
            minutes: 1,
            hours: 1,
            days: 1,
            ..RateLimitPolicy::default()
        };
        assert_eq!(policy.total_seconds(), Some(1 + 60 + 3600 + 86_400));
    }

    #[test]
    fn test_count_respects_window_and_sub_counts() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(3).per_hours(1));
        let now = ts("2020-01-23T12:00:00");
        let history = vec![
            entry("2020-01-23T10:00:00", json!({"extra_data": {"sub_counts": 1}})),
            entry("2020-01-23T11:30:00", json!({"extra_data": {"sub_counts": 1}})),
            entry("2020-01-23T11:40:00", json!({"extra_data": {"sub_counts": 0}})),
            entry("2020-01-23T11:45:00", json!({"extra_data": {"sub_counts": true}})),
            entry("2020-01-23T11:50:00", json!({"extra_data": {"sub_counts": false}})),
        ];
        let (used, oldest) = limiter.count_tokens(now, &history);
        assert_eq!(used, 2);
        assert_eq!(oldest, Some(ts("2020-01-23T11:30:00")));
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1).per_hours(1));
        let now = ts("2020-01-23T12:00:00");
        let history = vec![entry(
            "2020-01-23T11:00:00",
            json!({"extra_data": {"sub_counts": 1}}),
        )];
        assert_eq!(limiter.count_tokens(now, &history).0, 1);
    }

    #[test]
    fn test_malformed_history_counts_as_used() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(5).per_days(1));
        let now = ts("2020-01-23T12:00:00");
        let history = vec![
            PreviousSubmission {
                submission_time: Some("2020-01-23T11:00:00".into()),
                ..PreviousSubmission::default()
            },
            entry("2020-01-23T11:00:00", json!("not an object")),
            entry("2020-01-23T11:00:00", json!({"extra_data": {}})),
            entry("garbage", json!({"extra_data": {"sub_counts": 1}})),
        ];
        let (used, oldest) = limiter.count_tokens(now, &history);
        assert_eq!(used, 4);
        assert_eq!(oldest, Some(ts("2020-01-23T11:00:00")));
    }

    #[test]
    fn test_reset_time_and_exclusions() {
        let limiter = RateLimiter::new(
            RateLimitPolicy::new(5)
                .per_days(1)
                .with_reset_time("2020-01-23T11:00:00")
                .exclude("77"),
        );
        let now = ts("2020-01-23T12:00:00");
        let history = vec![
            entry("2020-01-23T10:00:00", json!({"extra_data": {"sub_counts": 1}})),
            entry("2020-01-23T11:00:00", json!({"extra_data": {"sub_counts": 1}})),
            entry("2020-01-23T11:30:00", json!({"extra_data": {"id": 77, "sub_counts": 1}})),
            entry("2020-01-23T11:31:00", json!({"extra_data": {"id": 78, "sub_counts": 1}})),
        ];
        assert_eq!(limiter.count_tokens(now, &history).0, 1);
    }

    #[test]
    fn test_local_runs_skip_unless_enforced() {
        let meta = SubmissionMetadata::default();
        let limiter = RateLimiter::new(RateLimitPolicy::new(1).per_hours(1));
        assert_eq!(limiter.decide(Some(&meta), true), RateLimitDecision::Skipped);

        let mut policy = RateLimitPolicy::new(1).per_hours(1);
        policy.enforce_when_local = true;
        let limiter = RateLimiter::new(policy);
        assert!(matches!(
            limiter.decide(Some(&meta), true),
            RateLimitDecision::Allowed(_)
        ));
    }

    #[test]
    fn test_summary_text() {
        let usage = TokenUsage {
            used: 1,
            budget: 2,
            oldest: None,
            now: ts("2020-01-23T12:00:00"),
            window: TimeDelta::try_hours(1).unwrap(),
        };
        let counted = usage.summary(true);
        assert!(counted.starts_with("[Rate Limit]: You have used 2 of 2 tokens in the past 1 hour.\n"));
        assert!(counted.contains("regenerate at Thu Jan 23 13:00:00 2020"));

        let fresh = TokenUsage { used: 0, ..usage };
        assert!(fresh.summary(false).contains("you have not used any tokens!"));
    }

    #[test]
    fn test_unset_submission() {
        let mut state = RunState::default();
        state.set_extra(SUB_COUNTS_KEY, json!(1));
        assert!(submission_counts(&state));
        unset_submission(&mut state);
        assert!(!submission_counts(&state));
    }

    #[test]
    fn test_format_window() {
        assert_eq!(format_window(TimeDelta::try_seconds(90_061).unwrap()), "1 day, 1 hour, 1 minute, 1 second");
        assert_eq!(format_window(TimeDelta::zero()), "0 seconds");
    }

    #[test]
    fn test_validate_rejects_bad_reset_time() {
        let policy = RateLimitPolicy::new(1).per_hours(1).with_reset_time("soon");
        assert!(policy.validate().is_err());
        assert!(RateLimitPolicy::new(1).validate().is_err());
        assert!(RateLimitPolicy::new(1).per_hours(1).validate().is_ok());
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let overflow = RateLimitPolicy::new(1).per_days(u64::MAX);
        assert_eq!(overflow.total_seconds(), None);
        assert_eq!(overflow.window(), TimeDelta::MAX);
        assert!(overflow.validate().is_err());

        // Fits in u64 seconds but not in a duration.
        let too_long = RateLimitPolicy::new(1).per_days(200_000_000_000);
        assert!(too_long.total_seconds().is_some());
        assert!(too_long.validate().is_err());

        // Disabled policies are checked too.
        let disabled = RateLimitPolicy {
            seconds: u64::MAX,
            minutes: 1,
            ..RateLimitPolicy::default()
        };
        assert!(disabled.validate().is_err());
    }

    #[test]
    fn test_summary_with_unreachable_regeneration() {
        let policy = RateLimitPolicy::new(1).per_days(100_000_000);
        assert!(policy.validate().is_ok());
        let usage = TokenUsage {
            used: 1,
            budget: 1,
            oldest: Some(ts("2020-01-23T11:00:00")),
            now: ts("2020-01-23T12:00:00"),
            window: policy.window(),
        };
        let text = usage.summary(false);
        assert!(text.starts_with("[Rate Limit]: You have used 1 of 1 tokens in the past 100000000 days.\n"));
        assert!(!text.contains("regenerate"));
        assert!(text.ends_with("\n\n"));
    }
}
