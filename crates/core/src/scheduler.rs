use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    DEFAULT_DIFFICULTY, InvariantViolation, MAX_DIFFICULTY, MAX_STABILITY, MIN_DIFFICULTY,
    MIN_STABILITY, Outcome, Rating, SchedulingState, Stage,
};
use crate::time::MINUTES_PER_DAY;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("{field} must be finite and > 0, got {provided}")]
    NonPositive { field: &'static str, provided: f64 },
    #[error("fail stability factor must be in (0, 1], got {provided}")]
    InvalidFailFactor { provided: f64 },
    #[error("learning floors must be non-decreasing")]
    UnorderedFloors,
    #[error("review threshold ({review}) must be below the burn threshold ({burned})")]
    InvalidThresholds { review: f64, burned: f64 },
}

//
// ─── CONFIG ────────────────────────────────────────────────────────────────────
//

/// Tunable constants of the scheduling engine. All stabilities are in days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on failure intensity.
    pub intensity_cap: f64,
    /// Struggle passes above this intensity count as a lapse.
    pub lapse_intensity: f64,
    /// Difficulty added per unit of intensity.
    pub difficulty_penalty: f64,
    /// Exponential stability decay per unit of intensity.
    pub stability_decay: f64,
    /// Stability multiplier applied on a hard fail.
    pub fail_stability_factor: f64,
    /// Difficulty removed on a clean pass.
    pub pass_difficulty_step: f64,
    /// Base multiplier for mature (rep >= 5) clean passes.
    pub growth_factor: f64,
    /// Minimum stability for reps 1 through 4.
    pub learning_floors: [f64; 4],
    pub review_threshold: f64,
    pub burn_threshold: f64,
    /// Hours until the first review of a freshly discovered facet.
    pub initial_interval_hours: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            intensity_cap: 4.0,
            lapse_intensity: 1.0,
            difficulty_penalty: 0.2,
            stability_decay: 0.3,
            fail_stability_factor: 0.5,
            pass_difficulty_step: 0.1,
            growth_factor: 1.5,
            learning_floors: [4.0 / 24.0, 8.0 / 24.0, 1.0, 3.0],
            review_threshold: 3.0,
            burn_threshold: 120.0,
            initial_interval_hours: 4.0,
        }
    }
}

impl EngineConfig {
    /// Validates every constant.
    ///
    /// # Errors
    ///
    /// Returns the first `SchedulerError` encountered.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let positive = [
            ("intensity_cap", self.intensity_cap),
            ("lapse_intensity", self.lapse_intensity),
            ("difficulty_penalty", self.difficulty_penalty),
            ("stability_decay", self.stability_decay),
            ("pass_difficulty_step", self.pass_difficulty_step),
            ("growth_factor", self.growth_factor),
            ("review_threshold", self.review_threshold),
            ("burn_threshold", self.burn_threshold),
            ("initial_interval_hours", self.initial_interval_hours),
        ];
        for (field, provided) in positive {
            if !provided.is_finite() || provided <= 0.0 {
                return Err(SchedulerError::NonPositive { field, provided });
            }
        }
        for floor in self.learning_floors {
            if !floor.is_finite() || floor <= 0.0 {
                return Err(SchedulerError::NonPositive {
                    field: "learning_floors",
                    provided: floor,
                });
            }
        }
        if !(self.fail_stability_factor > 0.0 && self.fail_stability_factor <= 1.0) {
            return Err(SchedulerError::InvalidFailFactor {
                provided: self.fail_stability_factor,
            });
        }
        if self.learning_floors.windows(2).any(|w| w[0] > w[1]) {
            return Err(SchedulerError::UnorderedFloors);
        }
        if self.review_threshold >= self.burn_threshold {
            return Err(SchedulerError::InvalidThresholds {
                review: self.review_threshold,
                burned: self.burn_threshold,
            });
        }
        Ok(())
    }
}

//
// ─── SCHEDULED REVIEW ──────────────────────────────────────────────────────────
//

/// Engine output: the next state and when the facet is due again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledReview {
    pub state: SchedulingState,
    pub due_at: DateTime<Utc>,
}

impl ScheduledReview {
    /// Whole minutes between `reviewed_at` and the due time.
    #[must_use]
    pub fn interval_minutes(&self, reviewed_at: DateTime<Utc>) -> i64 {
        self.due_at.signed_duration_since(reviewed_at).num_minutes()
    }
}

//
// ─── ENGINE ────────────────────────────────────────────────────────────────────
//

/// Failure-aware scheduling calculator.
///
/// Given a facet's state and one committing outcome, produces the next state
/// and due time. There is no hidden state: the same inputs always yield the
/// same output, so one engine can be shared freely between sessions.
///
/// Three paths exist:
///
/// - **hard fail**: reps reset, a lapse is recorded, stability halves
/// - **struggle pass**: the learner got it right only after missing it earlier in
///   the session; difficulty grows and stability decays with failure intensity
/// - **clean pass**: reps grow, difficulty eases, stability never shrinks
///
/// # Examples
///
/// ```
/// # use kioku_core::scheduler::SchedulingEngine;
/// # use kioku_core::model::{Outcome, SchedulingState, Stage};
/// let engine = SchedulingEngine::new();
/// let now = kioku_core::time::fixed_now();
/// let next = engine.compute_next(&SchedulingState::new_facet(), Outcome::pass(), now);
/// assert_eq!(next.state.stage, Stage::Learning);
/// assert_eq!(next.interval_minutes(now), 240);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulingEngine {
    config: EngineConfig,
}

impl SchedulingEngine {
    /// Engine with the default constants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with custom constants.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError` if the config fails validation.
    pub fn try_new(config: EngineConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// `min(log2(w + 1), cap)`; zero for a clean answer.
    #[must_use]
    pub fn failure_intensity(&self, session_failures: u32) -> f64 {
        (f64::from(session_failures) + 1.0)
            .log2()
            .min(self.config.intensity_cap)
    }

    /// Starting state written for every facet of a unit once its discovery quiz is passed.
    #[must_use]
    pub fn initial_state(&self) -> SchedulingState {
        SchedulingState {
            stage: Stage::Learning,
            stability: round_to(self.config.initial_interval_hours / 24.0, 4).max(MIN_STABILITY),
            difficulty: DEFAULT_DIFFICULTY,
            reps: 1,
            lapses: 0,
        }
    }

    /// Initial state plus its due time.
    #[must_use]
    pub fn schedule_discovered(&self, now: DateTime<Utc>) -> ScheduledReview {
        let state = self.initial_state();
        ScheduledReview {
            state,
            due_at: self.due_at(state.stability, now),
        }
    }

    /// Due time for a stability: `now + max(1, round(stability * 1440))` minutes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn due_at(&self, stability: f64, now: DateTime<Utc>) -> DateTime<Utc> {
        let minutes = (stability * MINUTES_PER_DAY).round().max(1.0) as i64;
        now + Duration::minutes(minutes)
    }

    /// Computes the next state and due time for one committing outcome.
    #[must_use]
    pub fn compute_next(
        &self,
        state: &SchedulingState,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> ScheduledReview {
        let prev = state.normalized();
        let cfg = &self.config;
        let failures = outcome.session_failures;
        let mut next = prev;

        match (outcome.rating, failures) {
            (Rating::Fail, _) => {
                let intensity = if failures == 0 {
                    1.0
                } else {
                    self.failure_intensity(failures)
                };
                next.reps = 0;
                next.lapses = prev.lapses.saturating_add(1);
                next.stability = (prev.stability * cfg.fail_stability_factor).max(MIN_STABILITY);
                next.difficulty =
                    clamp_difficulty(prev.difficulty + cfg.difficulty_penalty * intensity);
                next.stage = Stage::Learning;
            }
            (Rating::Pass, 0) => {
                next.reps = prev.reps.saturating_add(1);
                next.difficulty = clamp_difficulty(prev.difficulty - cfg.pass_difficulty_step);
                let grown = match next.reps {
                    n @ 1..=4 => cfg.learning_floors[(n - 1) as usize],
                    _ => {
                        prev.stability
                            * cfg.growth_factor
                            * (1.0 + (MAX_DIFFICULTY - next.difficulty) * 0.1)
                    }
                };
                next.stability = grown.max(prev.stability).min(MAX_STABILITY);
                next.stage = self.stage_after_clean_pass(prev.stage, next.stability);
            }
            (Rating::Pass, _) => {
                let intensity = self.failure_intensity(failures);
                next.difficulty =
                    clamp_difficulty(prev.difficulty + cfg.difficulty_penalty * intensity);
                next.stability =
                    (prev.stability * (-cfg.stability_decay * intensity).exp()).max(MIN_STABILITY);
                if intensity > cfg.lapse_intensity {
                    next.lapses = prev.lapses.saturating_add(1);
                    next.reps = (prev.reps / 2).max(1);
                    next.stage = Stage::Learning;
                } else {
                    next.stage = match prev.stage {
                        Stage::New => Stage::Learning,
                        Stage::Burned => Stage::Review,
                        other => other,
                    };
                }
            }
        }

        let next = self.finish(&prev, next, outcome);
        ScheduledReview {
            state: next,
            due_at: self.due_at(next.stability, now),
        }
    }

    fn stage_after_clean_pass(&self, previous: Stage, stability: f64) -> Stage {
        if previous == Stage::Burned {
            return Stage::Burned;
        }
        if stability >= self.config.burn_threshold && previous == Stage::Review {
            Stage::Burned
        } else if stability >= self.config.review_threshold {
            Stage::Review
        } else {
            Stage::Learning
        }
    }

    /// Rounds the candidate and enforces the invariants, clamping if one is broken.
    fn finish(
        &self,
        prev: &SchedulingState,
        mut next: SchedulingState,
        outcome: Outcome,
    ) -> SchedulingState {
        let clean_pass = outcome.rating == Rating::Pass && outcome.session_failures == 0;

        next.stability = round_to(next.stability, 4);
        if clean_pass && next.stability < prev.stability {
            next.stability = ceil_to(prev.stability, 4);
        }
        next.stability = next.stability.clamp(MIN_STABILITY, MAX_STABILITY);
        next.difficulty = round_to(next.difficulty, 2).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);

        if let Err(violation) = check_transition(prev, &next, clean_pass) {
            if cfg!(debug_assertions) {
                panic!("scheduling invariant violated: {violation}");
            }
            tracing::error!(%violation, "scheduling invariant violated, clamping result");
            next = next.clamped();
            if clean_pass {
                next.stability = next.stability.max(prev.stability);
                if prev.stage == Stage::Burned {
                    next.stage = Stage::Burned;
                }
            }
        }
        next
    }
}

fn check_transition(
    prev: &SchedulingState,
    next: &SchedulingState,
    clean_pass: bool,
) -> Result<(), InvariantViolation> {
    next.check_bounds()?;
    if clean_pass {
        if next.stability < prev.stability {
            return Err(InvariantViolation::StabilityRegressed {
                previous: prev.stability,
                next: next.stability,
            });
        }
        if prev.stage == Stage::Burned && next.stage != Stage::Burned {
            return Err(InvariantViolation::BurnedRegressed);
        }
    }
    Ok(())
}

fn clamp_difficulty(value: f64) -> f64 {
    value.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

fn ceil_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).ceil() / factor
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
