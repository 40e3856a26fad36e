//! Error types for tally.

use thiserror::Error;

/// Result type alias for tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors that can occur in tally core operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input that is not a well-formed record or protocol line
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

impl TallyError {
    /// Whether this error was caused by malformed client input.
    #[must_use]
    pub fn is_invalid_format(&self) -> bool {
        matches!(self, Self::InvalidFormat(_))
    }
}
