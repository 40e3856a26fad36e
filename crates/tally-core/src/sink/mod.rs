//! Output sink abstraction.
//!
//! The persistence worker appends every unique record to a [`RecordSink`].
//! The production sink is the line-oriented output artifact on the local
//! filesystem ([`FileSink`]); tests substitute sinks that fail on demand.

mod file;
mod memory;

pub use file::{DurableWrite, FileSink, DEFAULT_OUTPUT_PATH};
pub use memory::MemorySink;

use std::future::Future;

use crate::error::Result;
use crate::types::Record;

/// Trait for record sinks.
///
/// Methods return `Send` futures so the persistence worker can run on a
/// multi-threaded runtime.
pub trait RecordSink: Send {
    /// Append one record and make it durable before returning.
    fn append(&mut self, record: Record) -> impl Future<Output = Result<()>> + Send;

    /// Flush and release the underlying resource.
    ///
    /// Appending after `close` is an error.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}
