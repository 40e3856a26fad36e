//! Periodic throughput reporting.
//!
//! Every interval the reporter reads and resets the interval counters of
//! the [`MembershipStore`] and emits one stats line. An idle interval still
//! produces a line of zeros. When cancelled it emits one final line so the
//! cumulative total is always visible at exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::membership::{IntervalReport, MembershipStore};

/// Default reporting period.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Emits interval statistics on a fixed cadence.
pub struct Reporter {
    store: Arc<MembershipStore>,
    interval: Duration,
}

impl Reporter {
    /// Create a reporter over `store` firing every `interval`.
    #[must_use]
    pub fn new(store: Arc<MembershipStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Reporting period.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Read-and-reset the interval counters and log them.
    pub async fn report(&self) -> IntervalReport {
        let report = self.store.snapshot_and_reset().await;
        info!(
            unique = report.unique,
            duplicates = report.duplicates,
            unique_total = report.unique_total,
            "Received {} unique numbers, {} duplicates. Unique total: {}",
            report.unique,
            report.duplicates,
            report.unique_total
        );
        report
    }

    /// Report every interval until `cancel` fires, then report once more.
    ///
    /// Returns the final report.
    pub async fn run(self, cancel: CancellationToken) -> IntervalReport {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }

        let last = self.report().await;
        info!("Reporter stopped");
        last
    }
}
