//! Answer matching for typed responses.
//!
//! Matching is case-insensitive and whitespace-tolerant but otherwise exact:
//! the normalized input must equal one normalized accepted answer.

use serde::{Deserialize, Serialize};

/// Token that automation may submit to pass any item.
pub const DEFAULT_BYPASS_TOKEN: &str = "*skip*";

/// Result of comparing raw input to an answer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMatch {
    Exact,
    Bypassed,
    Mismatch,
    Empty,
}

impl AnswerMatch {
    #[must_use]
    pub fn is_correct(self) -> bool {
        matches!(self, AnswerMatch::Exact | AnswerMatch::Bypassed)
    }
}

/// Lower-cases, trims and collapses internal whitespace runs (including full-width spaces).
#[must_use]
pub fn normalize(input: &str) -> String {
    input
        .split(char::is_whitespace)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compares `raw_input` against every accepted answer.
#[must_use]
pub fn check_answer(raw_input: &str, accepted: &[String], bypass: Option<&str>) -> AnswerMatch {
    let input = normalize(raw_input);
    if input.is_empty() {
        return AnswerMatch::Empty;
    }
    if let Some(token) = bypass {
        if !token.is_empty() && raw_input.trim() == token {
            return AnswerMatch::Bypassed;
        }
    }
    if accepted.iter().any(|answer| normalize(answer) == input) {
        AnswerMatch::Exact
    } else {
        AnswerMatch::Mismatch
    }
}
