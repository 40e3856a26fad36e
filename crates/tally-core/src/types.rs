//! Common types for tally.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{is_valid_record, strip_leading_zeros, RECORD_DIGITS};
use crate::error::{Result, TallyError};

/// Size of the record value domain: every 9-digit value is below this.
pub const RECORD_DOMAIN: u32 = 1_000_000_000;

/// A validated record: a non-negative integer below [`RECORD_DOMAIN`].
///
/// Records have no identity beyond their value. Two tokens that differ only
/// in leading zeros are the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Record(u32);

impl Record {
    /// Create a record from its numeric value.
    ///
    /// # Errors
    /// Returns [`TallyError::InvalidFormat`] if `value` is outside the domain.
    pub fn new(value: u32) -> Result<Self> {
        if value >= RECORD_DOMAIN {
            return Err(TallyError::InvalidFormat(format!(
                "record value {value} exceeds {RECORD_DIGITS} digits"
            )));
        }
        Ok(Self(value))
    }

    /// Parse a sanitized client token.
    ///
    /// # Errors
    /// Returns [`TallyError::InvalidFormat`] unless the token is exactly
    /// [`RECORD_DIGITS`] ASCII digits.
    pub fn parse(token: &str) -> Result<Self> {
        if !is_valid_record(token) {
            return Err(TallyError::InvalidFormat(format!(
                "expected {RECORD_DIGITS} digits, got {token:?}"
            )));
        }
        let canonical = strip_leading_zeros(token)?;
        let value = canonical
            .parse::<u32>()
            .map_err(|e| TallyError::InvalidFormat(format!("{token:?}: {e}")))?;
        Self::new(value)
    }

    /// Numeric value of the record.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Position of the record in a membership bitset.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for Record {
    type Error = TallyError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Record> for u32 {
    fn from(record: Record) -> Self {
        record.0
    }
}

impl FromStr for Record {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
