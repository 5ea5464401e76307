use thiserror::Error;

use crate::model::{ItemId, ParseIdError};

/// Rejected caller input. Returning one of these never mutates session state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("invalid rating value: {0}")]
    InvalidRating(String),

    #[error("invalid facet: {0}")]
    InvalidFacet(String),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error(transparent)]
    InvalidId(#[from] ParseIdError),

    #[error("item {0} is not part of this session")]
    UnknownItem(ItemId),

    #[error("item {0} was already completed")]
    AlreadyCompleted(ItemId),

    #[error("item {requested} is not the current item (expected {current})")]
    NotCurrentItem { requested: ItemId, current: ItemId },

    #[error("session already completed")]
    SessionComplete,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("lesson phase is over; the quiz has already started")]
    QuizAlreadyStarted,

    #[error("the quiz has not started yet")]
    QuizNotStarted,
}
