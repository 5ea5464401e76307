use serde::{Deserialize, Serialize};

use super::facet::Facet;
use super::ids::{ItemId, UnitId};
use super::outcome::Rating;
use super::state::SchedulingState;
use super::unit::{Unit, UnitError, UnitType};
use crate::validation::{self, AnswerMatch};

/// Accepted answers for one queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerKey {
    accepted: Vec<String>,
}

impl AnswerKey {
    #[must_use]
    pub fn new(accepted: Vec<String>) -> Self {
        let accepted = accepted
            .into_iter()
            .filter(|a| !a.trim().is_empty())
            .collect();
        Self { accepted }
    }

    #[must_use]
    pub fn accepted(&self) -> &[String] {
        &self.accepted
    }

    /// Checks raw input against every accepted answer, honoring an optional bypass token.
    #[must_use]
    pub fn check(&self, raw_input: &str, bypass: Option<&str>) -> AnswerMatch {
        validation::check_answer(raw_input, &self.accepted, bypass)
    }

    /// Rates typed input. An accepted answer is always a pass, so the give-up
    /// words only fail an item that does not accept them.
    #[must_use]
    pub fn rate(&self, raw_input: &str, bypass: Option<&str>) -> Rating {
        if self.check(raw_input, bypass).is_correct() {
            Rating::Pass
        } else {
            Rating::from_raw_input(raw_input)
        }
    }
}

/// One facet of one unit, as presented to the learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub unit_id: UnitId,
    pub facet: Facet,
    pub unit_type: UnitType,
    pub level: u32,
    pub character: String,
    pub prompt: String,
    pub answers: AnswerKey,
    /// Snapshot taken when the session was built. Commits compute from this value.
    pub state: SchedulingState,
}

impl QueueItem {
    /// Builds the item for `facet` of `unit`.
    ///
    /// # Errors
    ///
    /// Returns `UnitError::UnsupportedFacet` if the unit does not study that facet.
    pub fn build(
        unit: &Unit,
        facet: Facet,
        state: SchedulingState,
        example: Option<usize>,
    ) -> Result<Self, UnitError> {
        let (prompt, answers) = unit.question(facet, example)?;
        Ok(Self {
            id: ItemId::new(unit.id(), facet),
            unit_id: unit.id(),
            facet,
            unit_type: unit.unit_type(),
            level: unit.level(),
            character: unit.character().to_owned(),
            prompt,
            answers: AnswerKey::new(answers),
            state,
        })
    }
}

/// Session progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub remaining: usize,
    pub percentage: f64,
}

impl Progress {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(completed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64 * 100.0).min(100.0)
        };
        Self {
            completed,
            total,
            remaining: total.saturating_sub(completed),
            percentage,
        }
    }
}
