use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::facet::Facet;
use super::ids::UnitId;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnitError {
    #[error("unit character cannot be empty")]
    EmptyCharacter,
    #[error("unit must have at least one meaning")]
    MissingMeaning,
    #[error("level must be >= 1")]
    InvalidLevel,
    #[error("grammar pattern cannot be empty")]
    EmptyPattern,
    #[error("{facet} is not studied for {unit_type} units")]
    UnsupportedFacet { unit_type: UnitType, facet: Facet },
    #[error("unknown unit type: {0}")]
    UnknownType(String),
}

//
// ─── UNIT KIND ─────────────────────────────────────────────────────────────────
//

/// Example sentence for a grammar point. `answer` is the span hidden in the cloze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClozeExample {
    pub sentence: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
}

/// Kind-specific payload of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitKind {
    Radical {
        meanings: Vec<String>,
    },
    Kanji {
        meanings: Vec<String>,
        #[serde(default)]
        onyomi: Vec<String>,
        #[serde(default)]
        kunyomi: Vec<String>,
    },
    Vocabulary {
        meanings: Vec<String>,
        #[serde(default)]
        readings: Vec<String>,
    },
    Grammar {
        meanings: Vec<String>,
        pattern: String,
        #[serde(default)]
        examples: Vec<ClozeExample>,
    },
}

/// Data-free discriminant of `UnitKind`, used for filtering and storage columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Radical,
    Kanji,
    Vocabulary,
    Grammar,
}

impl UnitType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UnitType::Radical => "radical",
            UnitType::Kanji => "kanji",
            UnitType::Vocabulary => "vocabulary",
            UnitType::Grammar => "grammar",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitType {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "radical" => Ok(UnitType::Radical),
            "kanji" => Ok(UnitType::Kanji),
            "vocabulary" | "vocab" => Ok(UnitType::Vocabulary),
            "grammar" => Ok(UnitType::Grammar),
            _ => Err(UnitError::UnknownType(s.to_owned())),
        }
    }
}

impl UnitKind {
    #[must_use]
    pub fn unit_type(&self) -> UnitType {
        match self {
            UnitKind::Radical { .. } => UnitType::Radical,
            UnitKind::Kanji { .. } => UnitType::Kanji,
            UnitKind::Vocabulary { .. } => UnitType::Vocabulary,
            UnitKind::Grammar { .. } => UnitType::Grammar,
        }
    }

    #[must_use]
    pub fn meanings(&self) -> &[String] {
        match self {
            UnitKind::Radical { meanings }
            | UnitKind::Kanji { meanings, .. }
            | UnitKind::Vocabulary { meanings, .. }
            | UnitKind::Grammar { meanings, .. } => meanings,
        }
    }

    /// Accepted readings; empty for kinds without a reading facet.
    #[must_use]
    pub fn readings(&self) -> Vec<String> {
        match self {
            UnitKind::Kanji {
                onyomi, kunyomi, ..
            } => onyomi
                .iter()
                .chain(kunyomi.iter())
                .filter(|r| !r.trim().is_empty())
                .cloned()
                .collect(),
            UnitKind::Vocabulary { readings, .. } => readings
                .iter()
                .filter(|r| !r.trim().is_empty())
                .cloned()
                .collect(),
            UnitKind::Radical { .. } | UnitKind::Grammar { .. } => Vec::new(),
        }
    }
}

//
// ─── UNIT ──────────────────────────────────────────────────────────────────────
//

/// A curriculum unit, owned by the external content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    id: UnitId,
    level: u32,
    character: String,
    kind: UnitKind,
}

impl Unit {
    /// Builds a validated unit.
    ///
    /// # Errors
    ///
    /// Returns `UnitError` when the character, meanings, level or grammar pattern are empty.
    pub fn new(
        id: UnitId,
        level: u32,
        character: impl Into<String>,
        kind: UnitKind,
    ) -> Result<Self, UnitError> {
        let character = character.into();
        if character.trim().is_empty() {
            return Err(UnitError::EmptyCharacter);
        }
        if level == 0 {
            return Err(UnitError::InvalidLevel);
        }
        if kind.meanings().iter().all(|m| m.trim().is_empty()) {
            return Err(UnitError::MissingMeaning);
        }
        if let UnitKind::Grammar { pattern, .. } = &kind {
            if pattern.trim().is_empty() {
                return Err(UnitError::EmptyPattern);
            }
        }
        Ok(Self {
            id,
            level,
            character,
            kind,
        })
    }

    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn character(&self) -> &str {
        &self.character
    }

    #[must_use]
    pub fn kind(&self) -> &UnitKind {
        &self.kind
    }

    #[must_use]
    pub fn unit_type(&self) -> UnitType {
        self.kind.unit_type()
    }

    /// Facets scheduled for this unit, in canonical order.
    #[must_use]
    pub fn facets(&self) -> Vec<Facet> {
        match &self.kind {
            UnitKind::Radical { .. } => vec![Facet::Meaning],
            UnitKind::Kanji { .. } | UnitKind::Vocabulary { .. } => {
                if self.kind.readings().is_empty() {
                    vec![Facet::Meaning]
                } else {
                    vec![Facet::Meaning, Facet::Reading]
                }
            }
            UnitKind::Grammar { .. } => vec![Facet::Cloze],
        }
    }

    #[must_use]
    pub fn supports(&self, facet: Facet) -> bool {
        self.facets().contains(&facet)
    }

    /// Number of example sentences available for cloze prompts.
    #[must_use]
    pub fn example_count(&self) -> usize {
        match &self.kind {
            UnitKind::Grammar { examples, .. } => examples.len(),
            _ => 0,
        }
    }

    /// Prompt text and accepted answers for one facet.
    ///
    /// `example` selects the grammar example sentence; it is ignored for other
    /// kinds and falls back to the bare pattern when out of range.
    ///
    /// # Errors
    ///
    /// Returns `UnitError::UnsupportedFacet` when the facet is not studied for this kind.
    pub fn question(
        &self,
        facet: Facet,
        example: Option<usize>,
    ) -> Result<(String, Vec<String>), UnitError> {
        let unsupported = || UnitError::UnsupportedFacet {
            unit_type: self.unit_type(),
            facet,
        };
        match (&self.kind, facet) {
            (_, Facet::Meaning) if self.unit_type() != UnitType::Grammar => Ok((
                format!("Meaning of {}?", self.character),
                self.kind.meanings().to_vec(),
            )),
            (UnitKind::Kanji { .. } | UnitKind::Vocabulary { .. }, Facet::Reading) => {
                let readings = self.kind.readings();
                if readings.is_empty() {
                    return Err(unsupported());
                }
                Ok((format!("Reading of {}?", self.character), readings))
            }
            (
                UnitKind::Grammar {
                    meanings,
                    pattern,
                    examples,
                },
                Facet::Cloze,
            ) => match example.and_then(|i| examples.get(i)) {
                Some(ex) => Ok((cloze_prompt(ex), vec![ex.answer.clone()])),
                None => Ok((
                    format!("Grammar pattern for \"{}\"?", meanings.join(", ")),
                    vec![pattern.clone()],
                )),
            },
            _ => Err(unsupported()),
        }
    }
}

fn cloze_prompt(example: &ClozeExample) -> String {
    let blanked = if example.answer.is_empty() {
        example.sentence.clone()
    } else {
        example.sentence.replacen(&example.answer, "＿＿", 1)
    };
    match &example.translation {
        Some(translation) => format!("{blanked} ({translation})"),
        None => blanked,
    }
}
