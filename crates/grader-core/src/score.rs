//! Score outcomes returned by checks and their normalisation.

use serde::{Deserialize, Serialize};

/// What a check callback reports back.
///
/// Normalised once at the check-unit boundary (see
/// [`crate::check::CheckUnit::apply_outcome`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", content = "value")]
pub enum ScoreOutcome {
    /// An explicit number of points.
    Numeric(f64),

    /// Full marks.
    Max,

    /// Passed: full marks, and the unit's verdict becomes `true`.
    Pass,

    /// Failed: zero points, and the unit's verdict becomes `false`.
    Fail,

    /// Leave the score untouched (the callback may have set it itself).
    Unset,
}

impl ScoreOutcome {
    /// Pass/fail verdict implied by this outcome, if any.
    pub fn verdict(&self) -> Option<bool> {
        match self {
            ScoreOutcome::Pass => Some(true),
            ScoreOutcome::Fail => Some(false),
            _ => None,
        }
    }
}

impl From<bool> for ScoreOutcome {
    fn from(passed: bool) -> Self {
        if passed {
            ScoreOutcome::Pass
        } else {
            ScoreOutcome::Fail
        }
    }
}

impl From<f64> for ScoreOutcome {
    fn from(value: f64) -> Self {
        ScoreOutcome::Numeric(value)
    }
}

impl From<u32> for ScoreOutcome {
    fn from(value: u32) -> Self {
        ScoreOutcome::Numeric(f64::from(value))
    }
}

impl From<Option<f64>> for ScoreOutcome {
    fn from(value: Option<f64>) -> Self {
        value.map_or(ScoreOutcome::Unset, ScoreOutcome::Numeric)
    }
}

/// Clamp `score` into the bounds enabled by `ceil` and `floor`.
///
/// `ceil` clamps down to `max_score` (when one is set); `floor` clamps up
/// to zero.
pub fn clamp_score(score: f64, max_score: Option<f64>, ceil: bool, floor: bool) -> f64 {
    let mut score = score;
    if ceil {
        if let Some(max) = max_score {
            if score > max {
                score = max;
            }
        }
    }
    if floor && score < 0.0 {
        score = 0.0;
    }
    score
}

/// Render a score without a trailing `.0` for whole numbers.
pub fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_within_bounds() {
        for raw in [-5.0, -0.1, 0.0, 3.5, 10.0, 10.1, 1e9] {
            let s = clamp_score(raw, Some(10.0), true, true);
            assert!((0.0..=10.0).contains(&s), "{} clamped to {}", raw, s);
        }
    }

    #[test]
    fn test_clamp_flags_disabled() {
        assert_eq!(clamp_score(12.0, Some(10.0), false, true), 12.0);
        assert_eq!(clamp_score(-2.0, Some(10.0), true, false), -2.0);
    }

    #[test]
    fn test_clamp_without_max() {
        assert_eq!(clamp_score(50.0, None, true, true), 50.0);
        assert_eq!(clamp_score(-1.0, None, true, true), 0.0);
    }

    #[test]
    fn test_outcome_from_bool() {
        assert_eq!(ScoreOutcome::from(true), ScoreOutcome::Pass);
        assert_eq!(ScoreOutcome::from(false), ScoreOutcome::Fail);
        assert_eq!(ScoreOutcome::Pass.verdict(), Some(true));
        assert_eq!(ScoreOutcome::Max.verdict(), None);
    }

    #[test]
    fn test_outcome_from_option() {
        assert_eq!(ScoreOutcome::from(None), ScoreOutcome::Unset);
        assert_eq!(ScoreOutcome::from(Some(2.5)), ScoreOutcome::Numeric(2.5));
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(3.0), "3");
        assert_eq!(format_score(2.5), "2.5");
        assert_eq!(format_score(0.0), "0");
    }
}
