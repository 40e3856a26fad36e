//! # tally-core
//!
//! Shared building blocks for the tally ingest server.
//!
//! Provides:
//! - The [`Record`] type: a validated 9-digit non-negative integer
//! - Codec helpers for the line protocol ([`codec`])
//! - The [`RecordSink`] abstraction and the file-backed output artifact
//! - The crate-wide error type

pub mod codec;
pub mod error;
pub mod sink;
pub mod types;

pub use codec::{sanitize, strip_leading_zeros, LineDecoder, TERMINATE_KEYWORD};
pub use error::{Result, TallyError};
pub use sink::{DurableWrite, FileSink, MemorySink, RecordSink, DEFAULT_OUTPUT_PATH};
pub use types::{Record, RECORD_DOMAIN};
