use std::{fmt::Debug, str::FromStr};

use regex::Regex;
use serde::Deserialize;

use crate::{
    config::TermOverrides,
    extract::{count_mentions, first_location_percent},
    pipeline::{FeatureRow, TermFeatures},
};

#[derive(Debug, thiserror::Error)]
pub enum LexiconError {
    #[error("term `{phrase}` is not a valid pattern")]
    InvalidTerm {
        phrase: String,
        #[source]
        source: regex::Error,
    },
    #[error("{terms} terms but {columns} output columns, they must pair up one to one")]
    LengthMismatch { terms: usize, columns: usize },
    #[error("unsupported language code `{0}`")]
    UnknownLanguage(String),
}

/// A phrase searched for in revision text.
///
/// Counting treats the phrase as a regular expression, locating treats it literally.
#[derive(Clone)]
pub struct Term {
    phrase: String,
    pattern: Regex,
}

impl Term {
    pub fn new(phrase: impl Into<String>) -> Result<Self, LexiconError> {
        let phrase = phrase.into();
        match Regex::new(&phrase) {
            Ok(pattern) => Ok(Self { phrase, pattern }),
            Err(source) => Err(LexiconError::InvalidTerm { phrase, source }),
        }
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }
}

impl Debug for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Term").field(&self.phrase).finish()
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.phrase == other.phrase
    }
}

/// Canonical feature a term feeds. Column names stay the same whatever the page language,
/// so English and Spanish datasets line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermSlot {
    Crisis,
    Inflation,
}

impl TermSlot {
    pub const ALL: [TermSlot; 2] = [TermSlot::Crisis, TermSlot::Inflation];

    pub fn column_name(self) -> &'static str {
        match self {
            TermSlot::Crisis => "crisis",
            TermSlot::Inflation => "inflation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[default]
    #[serde(rename = "es")]
    Spanish,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }

    /// The phrases searched for on pages of this language, one per slot.
    pub fn default_phrases(self) -> [(TermSlot, &'static str); 2] {
        match self {
            Language::English => [
                (TermSlot::Crisis, "economic crisis"),
                (TermSlot::Inflation, "inflation"),
            ],
            Language::Spanish => [
                (TermSlot::Crisis, "crisis económica"),
                (TermSlot::Inflation, "inflación"),
            ],
        }
    }
}

impl FromStr for Language {
    type Err = LexiconError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "en" => Ok(Language::English),
            "es" => Ok(Language::Spanish),
            other => Err(LexiconError::UnknownLanguage(other.to_string())),
        }
    }
}

/// Terms paired with the slots they are written to.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexicon {
    terms: Vec<Term>,
    slots: Vec<TermSlot>,
}

impl Lexicon {
    pub fn new<'a>(
        entries: impl IntoIterator<Item = (TermSlot, &'a str)>,
    ) -> Result<Self, LexiconError> {
        let mut terms = Vec::new();
        let mut slots = Vec::new();
        for (slot, phrase) in entries {
            terms.push(Term::new(phrase)?);
            slots.push(slot);
        }
        Ok(Self { terms, slots })
    }

    pub fn for_language(language: Language) -> Result<Self, LexiconError> {
        Self::new(language.default_phrases())
    }

    /// Language defaults, with any phrase given in `overrides` taking precedence.
    pub fn with_overrides(
        language: Language,
        overrides: &TermOverrides,
    ) -> Result<Self, LexiconError> {
        Self::new(language.default_phrases().map(|(slot, phrase)| {
            let phrase = match slot {
                TermSlot::Crisis => overrides.crisis.as_deref(),
                TermSlot::Inflation => overrides.inflation.as_deref(),
            }
            .unwrap_or(phrase);
            (slot, phrase)
        }))
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn slots(&self) -> &[TermSlot] {
        &self.slots
    }
}

/// A per-term feature computed from cleaned revision text.
pub trait Extractor {
    type Output;

    fn extract(&self, term: &Term, text: Option<&str>) -> Self::Output;

    fn store(&self, features: &mut TermFeatures, value: Self::Output);
}

/// Number of mentions, stored as the slot's `count`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MentionCount;

impl Extractor for MentionCount {
    type Output = usize;

    fn extract(&self, term: &Term, text: Option<&str>) -> usize {
        count_mentions(term, text)
    }

    fn store(&self, features: &mut TermFeatures, value: usize) {
        features.count = value;
    }
}

/// Position of the first mention, stored as the slot's `location`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstLocation;

impl Extractor for FirstLocation {
    type Output = Option<f64>;

    fn extract(&self, term: &Term, text: Option<&str>) -> Option<f64> {
        first_location_percent(term, text)
    }

    fn store(&self, features: &mut TermFeatures, value: Option<f64>) {
        features.location = value;
    }
}

/// Run `extractor` for every `(term, slot)` pair over the cleaned text of every row.
///
/// `terms` and `slots` are parallel sequences. If their lengths differ nothing is written and
/// [`LexiconError::LengthMismatch`] is returned.
pub fn apply_lexicon<E: Extractor>(
    rows: &mut [FeatureRow],
    extractor: &E,
    terms: &[Term],
    slots: &[TermSlot],
) -> Result<(), LexiconError> {
    if terms.len() != slots.len() {
        return Err(LexiconError::LengthMismatch {
            terms: terms.len(),
            columns: slots.len(),
        });
    }

    for (term, &slot) in terms.iter().zip(slots) {
        for row in rows.iter_mut() {
            let value = extractor.extract(term, row.text_clean.as_deref());
            extractor.store(row.term_mut(slot), value);
        }
    }

    Ok(())
}
