//! Error types for deduplication and persistence.

use tally_core::{Record, TallyError};
use thiserror::Error;

/// Result type alias for dedup operations.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Errors that can occur while classifying and persisting records.
#[derive(Error, Debug)]
pub enum DedupError {
    /// The sink refused the append; the record was not persisted.
    #[error("Sink write failed for record {record}: {source}")]
    Sink {
        record: Record,
        #[source]
        source: TallyError,
    },

    /// Record value does not fit the membership set.
    #[error("Record {record} outside membership capacity {capacity}")]
    OutOfCapacity { record: Record, capacity: usize },

    /// A record kept failing to persist and was given up on.
    #[error("Record {record} dropped after {attempts} failed writes")]
    WriteRetriesExhausted { record: Record, attempts: u32 },

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] TallyError),
}
