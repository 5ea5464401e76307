use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::ValidationError;

/// Lowest stability, in days, any state may carry.
pub const MIN_STABILITY: f64 = 0.1;
/// Upper cap on stability (one hundred years).
pub const MAX_STABILITY: f64 = 36_500.0;
pub const MIN_DIFFICULTY: f64 = 1.3;
pub const MAX_DIFFICULTY: f64 = 5.0;
/// Difficulty assumed for units that have never been scored.
pub const DEFAULT_DIFFICULTY: f64 = 3.0;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

/// A scheduling state that escaped its documented bounds.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum InvariantViolation {
    #[error("stability {0} is outside [{MIN_STABILITY}, {MAX_STABILITY}]")]
    Stability(f64),
    #[error("difficulty {0} is outside [{MIN_DIFFICULTY}, {MAX_DIFFICULTY}]")]
    Difficulty(f64),
    #[error("stability decreased on a clean pass ({previous} -> {next})")]
    StabilityRegressed { previous: f64, next: f64 },
    #[error("burned state left the burned stage on a clean pass")]
    BurnedRegressed,
}

//
// ─── STAGE ─────────────────────────────────────────────────────────────────────
//

/// Coarse lifecycle bucket of a facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    New,
    Learning,
    Review,
    Burned,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Learning => "learning",
            Stage::Review => "review",
            Stage::Burned => "burned",
        }
    }

    /// Review and Burned count towards level mastery.
    #[must_use]
    pub fn is_mastered(self) -> bool {
        matches!(self, Stage::Review | Stage::Burned)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Stage::New),
            "learning" => Ok(Stage::Learning),
            "review" => Ok(Stage::Review),
            "burned" => Ok(Stage::Burned),
            _ => Err(ValidationError::InvalidStage(s.to_owned())),
        }
    }
}

//
// ─── SCHEDULING STATE ──────────────────────────────────────────────────────────
//

/// Memory model of one (user, unit, facet) triple.
///
/// * `stability` - days until recall probability drops meaningfully
/// * `difficulty` - how hard the facet is for this learner, in `[1.3, 5.0]`
/// * `reps` - consecutive successful commits since the last reset
/// * `lapses` - total failures recorded against this facet
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulingState {
    pub stage: Stage,
    pub stability: f64,
    pub difficulty: f64,
    pub reps: u32,
    pub lapses: u32,
}

impl SchedulingState {
    /// State of a facet that has never been committed.
    #[must_use]
    pub fn new_facet() -> Self {
        Self {
            stage: Stage::New,
            stability: 0.0,
            difficulty: 0.0,
            reps: 0,
            lapses: 0,
        }
    }

    /// Replaces unset or nonsensical values with defaults and clamps into range.
    ///
    /// Zero difficulty means "never scored" and becomes the default difficulty;
    /// zero stability becomes the minimum.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let difficulty = if self.difficulty.is_finite() && self.difficulty > 0.0 {
            self.difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
        } else {
            DEFAULT_DIFFICULTY
        };
        let stability = if self.stability.is_finite() && self.stability > 0.0 {
            self.stability.clamp(MIN_STABILITY, MAX_STABILITY)
        } else {
            MIN_STABILITY
        };
        Self {
            stage: self.stage,
            stability,
            difficulty,
            reps: self.reps,
            lapses: self.lapses,
        }
    }

    /// Checks the hard numeric bounds.
    ///
    /// # Errors
    ///
    /// Returns the first `InvariantViolation` found.
    pub fn check_bounds(&self) -> Result<(), InvariantViolation> {
        if !self.stability.is_finite() || !(MIN_STABILITY..=MAX_STABILITY).contains(&self.stability)
        {
            return Err(InvariantViolation::Stability(self.stability));
        }
        if !self.difficulty.is_finite()
            || !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.difficulty)
        {
            return Err(InvariantViolation::Difficulty(self.difficulty));
        }
        Ok(())
    }

    /// Forces the numeric fields back into bounds.
    #[must_use]
    pub fn clamped(&self) -> Self {
        let stability = if self.stability.is_finite() {
            self.stability.clamp(MIN_STABILITY, MAX_STABILITY)
        } else {
            MIN_STABILITY
        };
        let difficulty = if self.difficulty.is_finite() {
            self.difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
        } else {
            DEFAULT_DIFFICULTY
        };
        Self {
            stability,
            difficulty,
            ..*self
        }
    }
}

impl Default for SchedulingState {
    fn default() -> Self {
        Self::new_facet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_fills_defaults() {
        let state = SchedulingState::new_facet().normalized();
        assert_eq!(state.difficulty, DEFAULT_DIFFICULTY);
        assert_eq!(state.stability, MIN_STABILITY);
        assert!(state.check_bounds().is_ok());
    }

    #[test]
    fn check_bounds_flags_out_of_range_values() {
        let mut state = SchedulingState::new_facet().normalized();
        state.difficulty = 7.0;
        assert_eq!(
            state.check_bounds(),
            Err(InvariantViolation::Difficulty(7.0))
        );
        state.difficulty = 3.0;
        state.stability = f64::NAN;
        assert!(matches!(
            state.check_bounds(),
            Err(InvariantViolation::Stability(_))
        ));
        assert!(state.clamped().check_bounds().is_ok());
    }

    #[test]
    fn stage_parse_rejects_unknown_buckets() {
        assert_eq!("burned".parse::<Stage>().unwrap(), Stage::Burned);
        assert_eq!(
            "relearning".parse::<Stage>().unwrap_err(),
            ValidationError::InvalidStage("relearning".into())
        );
    }
}
