mod facet;
mod ids;
mod outcome;
mod queue;
mod state;
mod unit;

pub use facet::Facet;
pub use ids::{BatchId, ItemId, ParseIdError, SessionId, TraceId, UnitId, UserId};
pub use outcome::{Outcome, Rating};
pub use queue::{AnswerKey, Progress, QueueItem};
pub use state::{
    DEFAULT_DIFFICULTY, InvariantViolation, MAX_DIFFICULTY, MAX_STABILITY, MIN_DIFFICULTY,
    MIN_STABILITY, SchedulingState, Stage,
};
pub use unit::{ClozeExample, Unit, UnitError, UnitKind, UnitType};
