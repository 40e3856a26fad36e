//! Exact membership store for the record domain.
//!
//! Unlike a Bloom filter, which trades accuracy for memory, the record
//! domain is small enough (10^9 values) to track exactly: one bit per
//! possible value is 125 MB. The bitset and the interval counters live
//! behind a single async mutex so that the dedup decision, the append to
//! the sink and the counter updates form one atomic step.
//!
//! # Example
//! ```ignore
//! use tally_core::{MemorySink, Record};
//! use tally_dedup::membership::{Classification, MembershipStore};
//!
//! let store = MembershipStore::with_capacity(1_000);
//! let mut sink = MemorySink::new();
//!
//! let record = Record::parse("000000042")?;
//! assert_eq!(store.record(record, &mut sink).await?, Classification::Unique);
//! assert_eq!(store.record(record, &mut sink).await?, Classification::Duplicate);
//!
//! let report = store.snapshot_and_reset().await;
//! assert_eq!((report.unique, report.duplicates, report.unique_total), (1, 1, 1));
//! ```

use serde::{Deserialize, Serialize};
use tally_core::{Record, RecordSink, RECORD_DOMAIN};
use tokio::sync::Mutex;

use crate::error::{DedupError, Result};

/// Fixed-capacity bitset stored as 64-bit words.
#[derive(Debug, Clone)]
pub struct MembershipSet {
    words: Vec<u64>,
    capacity: usize,
}

impl MembershipSet {
    /// Create an empty set able to hold values in `[0, capacity)`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    /// Number of representable values.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `index` is present. Out-of-range indices are never present.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Set `index`. Returns `true` if it was not already present.
    ///
    /// # Panics
    /// Panics if `index >= capacity`.
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(index < self.capacity, "index {index} out of range");
        let word = &mut self.words[index / 64];
        let mask = 1u64 << (index % 64);
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    /// Population count.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Whether no value is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Heap memory used by the bitset in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }
}

/// Outcome of recording a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// First time the value was seen; it has been persisted.
    Unique,
    /// Value was already persisted earlier.
    Duplicate,
}

/// Counters read by the reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalReport {
    /// Unique records persisted during the interval.
    pub unique: u64,
    /// Duplicate records seen during the interval.
    pub duplicates: u64,
    /// Unique records persisted since startup.
    pub unique_total: u64,
}

#[derive(Debug)]
struct MembershipState {
    set: MembershipSet,
    unique_in_interval: u64,
    duplicates_in_interval: u64,
    unique_total: u64,
}

/// Bitset plus interval counters, guarded by one lock.
///
/// Invariants, at any lock-held instant:
/// - bit `v` is set iff record `v` was appended to the sink at least once
/// - `unique_total` equals the population count of the bitset
#[derive(Debug)]
pub struct MembershipStore {
    state: Mutex<MembershipState>,
    capacity: usize,
}

impl Default for MembershipStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipStore {
    /// Create a store covering the whole record domain.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(RECORD_DOMAIN as usize)
    }

    /// Create a store covering `[0, capacity)`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MembershipState {
                set: MembershipSet::new(capacity),
                unique_in_interval: 0,
                duplicates_in_interval: 0,
                unique_total: 0,
            }),
            capacity,
        }
    }

    /// Number of representable values.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Classify `record` and persist it if it is new.
    ///
    /// The lock is held across the append, so two concurrent calls with the
    /// same value always yield exactly one [`Classification::Unique`]. The
    /// bit is set only after the sink accepted the record; on a sink error
    /// nothing changes and the caller may retry.
    ///
    /// # Errors
    /// - [`DedupError::Sink`] if the append failed
    /// - [`DedupError::OutOfCapacity`] if the value does not fit the set
    pub async fn record<S: RecordSink>(
        &self,
        record: Record,
        sink: &mut S,
    ) -> Result<Classification> {
        if record.index() >= self.capacity {
            return Err(DedupError::OutOfCapacity {
                record,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock().await;

        if state.set.contains(record.index()) {
            state.duplicates_in_interval += 1;
            return Ok(Classification::Duplicate);
        }

        sink.append(record)
            .await
            .map_err(|source| DedupError::Sink { record, source })?;

        state.set.insert(record.index());
        state.unique_in_interval += 1;
        state.unique_total += 1;
        Ok(Classification::Unique)
    }

    /// Read the counters and reset the interval ones.
    ///
    /// `unique_total` is cumulative and left untouched.
    pub async fn snapshot_and_reset(&self) -> IntervalReport {
        let mut state = self.state.lock().await;
        let report = IntervalReport {
            unique: state.unique_in_interval,
            duplicates: state.duplicates_in_interval,
            unique_total: state.unique_total,
        };
        state.unique_in_interval = 0;
        state.duplicates_in_interval = 0;
        report
    }

    /// Read the counters without resetting anything.
    pub async fn snapshot(&self) -> IntervalReport {
        let state = self.state.lock().await;
        IntervalReport {
            unique: state.unique_in_interval,
            duplicates: state.duplicates_in_interval,
            unique_total: state.unique_total,
        }
    }

    /// Whether `record` has been persisted.
    pub async fn contains(&self, record: Record) -> bool {
        self.state.lock().await.set.contains(record.index())
    }

    /// Population count of the bitset.
    pub async fn population(&self) -> u64 {
        self.state.lock().await.set.len()
    }
}
