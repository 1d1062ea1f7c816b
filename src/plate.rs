//! Licence plate validation and canonicalisation.
//!
//! Two layouts are accepted once separators are stripped and letters are
//! upper-cased:
//!
//! - legacy: `LLLNNNN` (`ABC-1234`, `abc1234`)
//! - Mercosul: `LLLNLNN` (`BRA2E19`), where the fifth position may be a letter or a digit
//!
//! Validation is pure: it never touches the cache, the rate limiter, or the
//! breaker, so malformed input cannot consume quota.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const PLATE_LEN: usize = 7;

/// Reasons a plate string is rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlateError {
    /// Nothing left after removing separators.
    #[error("plate is empty")]
    Empty,
    /// Plates have exactly seven characters once separators are removed.
    #[error("plate must have 7 characters after removing separators (got {len})")]
    WrongLength {
        /// Length after normalisation.
        len: usize,
    },
    /// Right length, wrong character classes.
    #[error("plate '{plate}' matches neither the legacy (LLLNNNN) nor the Mercosul (LLLNLNN) layout")]
    Layout {
        /// The normalised candidate.
        plate: String,
    },
}

/// Which registration layout a plate follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateFormat {
    /// Three letters and four digits.
    Legacy,
    /// Three letters, a digit, a letter, two digits.
    Mercosul,
}

/// A validated, canonical plate: upper-case, no separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Plate(String);

impl Plate {
    /// Validate and canonicalise `raw`.
    pub fn parse(raw: &str) -> Result<Self, PlateError> {
        let candidate: String = raw
            .chars()
            .filter(|c| !is_separator(*c))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if candidate.is_empty() {
            return Err(PlateError::Empty);
        }
        let len = candidate.chars().count();
        if len != PLATE_LEN {
            return Err(PlateError::WrongLength { len });
        }
        if !matches_layout(candidate.as_bytes()) {
            return Err(PlateError::Layout { plate: candidate });
        }
        Ok(Self(candidate))
    }

    /// Canonical text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Layout of this plate. Legacy plates are also valid Mercosul candidates
    /// structurally; the fifth character decides.
    pub fn format(&self) -> PlateFormat {
        if self.0.as_bytes()[4].is_ascii_alphabetic() {
            PlateFormat::Mercosul
        } else {
            PlateFormat::Legacy
        }
    }
}

/// Free-function form of [`Plate::parse`].
pub fn normalize(raw: &str) -> Result<Plate, PlateError> {
    Plate::parse(raw)
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == '-' || c == '.'
}

// Positions: 0-2 letters, 3 digit, 4 letter-or-digit, 5-6 digits.
fn matches_layout(bytes: &[u8]) -> bool {
    bytes.len() == PLATE_LEN
        && bytes[..3].iter().all(u8::is_ascii_uppercase)
        && bytes[3].is_ascii_digit()
        && (bytes[4].is_ascii_digit() || bytes[4].is_ascii_uppercase())
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

impl fmt::Display for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Plate {
    type Err = PlateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Plate {
    type Error = PlateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Plate> for String {
    fn from(plate: Plate) -> Self {
        plate.0
    }
}

impl AsRef<str> for Plate {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
