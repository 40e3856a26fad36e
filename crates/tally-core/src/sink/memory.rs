//! In-memory sink for tests and benchmarks.

use super::RecordSink;
use crate::error::{Result, TallyError};
use crate::types::Record;

/// Sink that keeps appended records in a `Vec`.
///
/// Can be told to fail the next `n` appends to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Record>,
    fail_next: u32,
    failures: u32,
    closed: bool,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with an I/O error.
    #[must_use]
    pub fn failing(mut self, n: u32) -> Self {
        self.fail_next = n;
        self
    }

    /// Records appended so far, in order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of appends that failed.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl RecordSink for MemorySink {
    async fn append(&mut self, record: Record) -> Result<()> {
        if self.closed {
            return Err(TallyError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory sink is closed",
            )));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.failures += 1;
            return Err(TallyError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }
        self.records.push(record);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
