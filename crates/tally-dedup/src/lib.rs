//! # tally-dedup
//!
//! Exact deduplication and persistence for the tally ingest server.
//!
//! ## Architecture
//!
//! ```text
//!  handlers ──push──▶ ┌──────────────┐  pop   ┌───────────────────┐
//!  (many producers)   │ hand-off     │ ─────▶ │ PersistenceWorker │──append──▶ sink
//!                     │ queue (mpsc) │        └─────────┬─────────┘
//!                     └──────────────┘                  │ record-and-classify
//!                                             ┌─────────▼─────────┐
//!                                             │  MembershipStore  │
//!                                             │ bitset + counters │
//!                                             └─────────▲─────────┘
//!                                                       │ snapshot-and-reset
//!                                             ┌─────────┴─────────┐
//!                                             │     Reporter      │
//!                                             └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`membership`] - bitset over the record domain and interval counters
//! - [`worker`] - single consumer of the hand-off queue
//! - [`reporter`] - periodic stats line

pub mod error;
pub mod membership;
pub mod reporter;
pub mod worker;

pub use error::{DedupError, Result};
pub use membership::{Classification, IntervalReport, MembershipSet, MembershipStore};
pub use reporter::{Reporter, DEFAULT_REPORT_INTERVAL};
pub use worker::{
    handoff_queue, PersistenceWorker, Processed, QueuedRecord, RecordReceiver, RecordSender,
    WorkerConfig, WorkerExit, WorkerStats,
};
