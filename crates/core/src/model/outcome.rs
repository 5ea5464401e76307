use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Binary verdict on a single answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Pass,
    Fail,
}

impl Rating {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Rating::Pass => "pass",
            Rating::Fail => "fail",
        }
    }

    #[must_use]
    pub fn is_pass(self) -> bool {
        matches!(self, Rating::Pass)
    }

    /// Interprets a raw answer: the literal words `again` / `fail` are an explicit
    /// give-up, everything else is a pass claim that still has to match the answer key.
    #[must_use]
    pub fn from_raw_input(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "again" | "fail" => Rating::Fail,
            _ => Rating::Pass,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "good" => Ok(Rating::Pass),
            "fail" | "again" => Ok(Rating::Fail),
            _ => Err(ValidationError::InvalidRating(s.to_owned())),
        }
    }
}

/// What the engine is told about one committing answer.
///
/// `session_failures` counts incorrect attempts on the same facet earlier in
/// the current session; zero means a clean first-try answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub rating: Rating,
    pub session_failures: u32,
}

impl Outcome {
    #[must_use]
    pub fn new(rating: Rating, session_failures: u32) -> Self {
        Self {
            rating,
            session_failures,
        }
    }

    #[must_use]
    pub fn pass() -> Self {
        Self::new(Rating::Pass, 0)
    }

    #[must_use]
    pub fn fail() -> Self {
        Self::new(Rating::Fail, 0)
    }

    #[must_use]
    pub fn struggled(session_failures: u32) -> Self {
        Self::new(Rating::Pass, session_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_accepts_aliases() {
        assert_eq!("good".parse::<Rating>().unwrap(), Rating::Pass);
        assert_eq!("AGAIN".parse::<Rating>().unwrap(), Rating::Fail);
        assert_eq!(" pass ".parse::<Rating>().unwrap(), Rating::Pass);
    }

    #[test]
    fn rating_rejects_unknown_values() {
        let err = "easy".parse::<Rating>().unwrap_err();
        assert_eq!(err, ValidationError::InvalidRating("easy".into()));
    }

    #[test]
    fn raw_give_up_words_are_failures() {
        assert_eq!(Rating::from_raw_input("again"), Rating::Fail);
        assert_eq!(Rating::from_raw_input(" Fail "), Rating::Fail);
        assert_eq!(Rating::from_raw_input("water"), Rating::Pass);
    }
}
