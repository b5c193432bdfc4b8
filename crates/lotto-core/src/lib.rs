//! Core domain model for lotto: draws, played selections and match evaluation.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lotto-core";

pub const NUMBERS_PER_DRAW: usize = 6;
pub const MIN_NUMBER: u8 = 1;
pub const MAX_NUMBER: u8 = 60;

/// Date format used by the remote draw service and in notifications.
pub const API_DATE_FORMAT: &str = "%d/%m/%Y";

/// Strict `dd/mm/yyyy` parse. Unpadded or otherwise irregular input is rejected.
pub fn parse_api_date(input: &str) -> Option<NaiveDate> {
    let bytes = input.as_bytes();
    if bytes.len() != 10 || bytes[2] != b'/' || bytes[5] != b'/' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2 && *i != 5)
        .all(|(_, b)| b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDate::parse_from_str(input, API_DATE_FORMAT).ok()
}

pub fn format_api_date(date: NaiveDate) -> String {
    date.format(API_DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumbersError {
    #[error("expected {expected} numbers, got {actual}")]
    WrongCount { expected: usize, actual: usize },
    #[error("number {0} is outside {MIN_NUMBER}..={MAX_NUMBER}")]
    OutOfRange(u32),
    #[error("number {0} appears more than once")]
    Duplicate(u8),
    #[error("`{0}` is not a number")]
    NotANumber(String),
}

fn parse_number(raw: &str) -> Result<u8, NumbersError> {
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|_| NumbersError::NotANumber(raw.to_string()))?;
    if value < u32::from(MIN_NUMBER) || value > u32::from(MAX_NUMBER) {
        return Err(NumbersError::OutOfRange(value));
    }
    Ok(value as u8)
}

fn validate_numbers(numbers: &[u8]) -> Result<(), NumbersError> {
    if numbers.len() != NUMBERS_PER_DRAW {
        return Err(NumbersError::WrongCount {
            expected: NUMBERS_PER_DRAW,
            actual: numbers.len(),
        });
    }
    let mut seen = BTreeSet::new();
    for &n in numbers {
        if !(MIN_NUMBER..=MAX_NUMBER).contains(&n) {
            return Err(NumbersError::OutOfRange(u32::from(n)));
        }
        if !seen.insert(n) {
            return Err(NumbersError::Duplicate(n));
        }
    }
    Ok(())
}

/// Six distinct drawn numbers, kept in the order the source reported them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DrawNumbers(Vec<u8>);

impl DrawNumbers {
    pub fn new(numbers: Vec<u8>) -> Result<Self, NumbersError> {
        validate_numbers(&numbers)?;
        Ok(Self(numbers))
    }

    pub fn parse_strs<S: AsRef<str>>(raw: &[S]) -> Result<Self, NumbersError> {
        let numbers = raw
            .iter()
            .map(|s| parse_number(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(numbers)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_set(&self) -> BTreeSet<u8> {
        self.0.iter().copied().collect()
    }

    /// Storage form: two-digit values joined by single spaces (`04 13 22 44 50 53`).
    pub fn to_storage_text(&self) -> String {
        self.0
            .iter()
            .map(|n| format!("{n:02}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn parse_storage_text(text: &str) -> Result<Self, NumbersError> {
        let parts = text.split_whitespace().collect::<Vec<_>>();
        Self::parse_strs(&parts)
    }
}

impl TryFrom<Vec<u8>> for DrawNumbers {
    type Error = NumbersError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DrawNumbers> for Vec<u8> {
    fn from(value: DrawNumbers) -> Self {
        value.0
    }
}

/// Canonical persisted draw. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRecord {
    pub id: u32,
    pub date: NaiveDate,
    pub numbers: DrawNumbers,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("invalid selection `{input}`: {source}")]
    Invalid {
        input: String,
        #[source]
        source: NumbersError,
    },
}

/// A player's six numbers to be scored against the draw of `evaluation_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayedSelection {
    numbers: BTreeSet<u8>,
    pub evaluation_date: NaiveDate,
}

impl PlayedSelection {
    pub fn new(
        numbers: impl IntoIterator<Item = u8>,
        evaluation_date: NaiveDate,
    ) -> Result<Self, SelectionError> {
        let numbers = numbers.into_iter().collect::<Vec<_>>();
        validate_numbers(&numbers).map_err(|source| SelectionError::Invalid {
            input: join_numbers(&numbers),
            source,
        })?;
        Ok(Self {
            numbers: numbers.into_iter().collect(),
            evaluation_date,
        })
    }

    /// Parses the comma-separated form used in configuration, e.g. `4,13,22,35,41,53`.
    pub fn parse(input: &str, evaluation_date: NaiveDate) -> Result<Self, SelectionError> {
        let numbers = input
            .split(',')
            .map(parse_number)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SelectionError::Invalid {
                input: input.to_string(),
                source,
            })?;
        Self::new(numbers, evaluation_date)
    }

    pub fn numbers(&self) -> &BTreeSet<u8> {
        &self.numbers
    }

    /// Ascending, comma-separated; half of the dedup key.
    pub fn selection_key(&self) -> String {
        join_numbers(self.numbers.iter().copied())
    }
}

fn join_numbers<I, N>(numbers: I) -> String
where
    I: IntoIterator<Item = N>,
    N: fmt::Display,
{
    numbers
        .into_iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub selection_key: String,
    pub hit_count: u8,
    pub evaluation_date: NaiveDate,
}

impl EvaluationResult {
    pub fn tier(&self) -> PrizeTier {
        PrizeTier::from_hits(self.hit_count)
    }
}

/// Presentation band derived from a hit count. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrizeTier {
    Sena,
    Quina,
    Quadra,
    NoPrize,
}

impl PrizeTier {
    pub fn from_hits(hit_count: u8) -> Self {
        match hit_count {
            6 => Self::Sena,
            5 => Self::Quina,
            4 => Self::Quadra,
            _ => Self::NoPrize,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sena => "Sena",
            Self::Quina => "Quina",
            Self::Quadra => "Quadra",
            Self::NoPrize => "No prize",
        }
    }

    pub fn is_prize(self) -> bool {
        self != Self::NoPrize
    }
}

impl fmt::Display for PrizeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn count_hits(selection: &PlayedSelection, numbers: &DrawNumbers) -> u8 {
    selection
        .numbers()
        .intersection(&numbers.to_set())
        .count() as u8
}

/// Scores a selection against a draw. The result carries the selection's evaluation
/// date; callers are responsible for checking it matches `draw.date`.
pub fn evaluate(selection: &PlayedSelection, draw: &DrawRecord) -> EvaluationResult {
    EvaluationResult {
        selection_key: selection.selection_key(),
        hit_count: count_hits(selection, &draw.numbers),
        evaluation_date: selection.evaluation_date,
    }
}
