use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// One independently scheduled aspect of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    Meaning,
    Reading,
    Cloze,
}

impl Facet {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Facet::Meaning => "meaning",
            Facet::Reading => "reading",
            Facet::Cloze => "cloze",
        }
    }

    /// Position within a quiz: meaning-type prompts come before readings of the same unit.
    #[must_use]
    pub fn quiz_rank(self) -> u8 {
        match self {
            Facet::Meaning | Facet::Cloze => 0,
            Facet::Reading => 1,
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Facet {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meaning" => Ok(Facet::Meaning),
            "reading" => Ok(Facet::Reading),
            "cloze" => Ok(Facet::Cloze),
            _ => Err(ValidationError::InvalidFacet(s.to_owned())),
        }
    }
}
