//! Persistence worker: the single consumer of the hand-off queue.
//!
//! Connection handlers push validated records onto an unbounded queue; the
//! worker pops them one at a time, classifies each against the
//! [`MembershipStore`] and appends unique ones to the output sink.
//!
//! ## Write failures
//!
//! A record whose append fails is pushed to the back of the queue and tried
//! again later. Retries are unbounded unless
//! [`WorkerConfig::max_write_retries`] is set.
//!
//! ## Shutdown
//!
//! - `stop` (cooperative): keep consuming until every producer is gone and
//!   the queue is empty, then exit.
//! - `interrupt` (forceful): exit at the next await point. Whatever is still
//!   queued is counted as abandoned.
//!
//! On either exit the sink is closed and the reporter token is cancelled.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_core::{Record, RecordSink};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DedupError, Result};
use crate::membership::{Classification, MembershipStore};

/// A record waiting in the hand-off queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedRecord {
    /// The record.
    pub record: Record,
    /// Failed write attempts so far.
    pub attempts: u32,
}

impl From<Record> for QueuedRecord {
    fn from(record: Record) -> Self {
        Self {
            record,
            attempts: 0,
        }
    }
}

/// Producer side of the hand-off queue.
pub type RecordSender = UnboundedSender<QueuedRecord>;

/// Consumer side of the hand-off queue.
pub type RecordReceiver = UnboundedReceiver<QueuedRecord>;

/// Create the hand-off queue.
#[must_use]
pub fn handoff_queue() -> (RecordSender, RecordReceiver) {
    mpsc::unbounded_channel()
}

/// Configuration for the persistence worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Give up on a record after this many failed writes. `None` retries forever.
    pub max_write_retries: Option<u32>,
}

impl WorkerConfig {
    /// Bound the number of write retries per record.
    #[must_use]
    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = Some(retries);
        self
    }
}

/// How the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerExit {
    /// Queue closed and fully drained.
    #[default]
    Drained,
    /// Forcefully interrupted.
    Interrupted,
}

/// Statistics from a worker run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Records popped from the queue, retries included.
    pub processed: u64,
    /// Records persisted.
    pub unique: u64,
    /// Records classified as duplicates.
    pub duplicates: u64,
    /// Failed sink writes.
    pub write_failures: u64,
    /// Records given up on after exhausting retries.
    pub dropped: u64,
    /// Records left in the queue when the worker was interrupted.
    pub abandoned: u64,
    /// How the loop ended.
    pub exit: WorkerExit,
}

/// Result of processing a single queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Classified and, if unique, persisted.
    Classified(Classification),
    /// Write failed; record re-enqueued.
    Retried,
    /// Record dropped.
    Dropped,
}

/// Single consumer of the hand-off queue.
pub struct PersistenceWorker<S: RecordSink> {
    config: WorkerConfig,
    store: Arc<MembershipStore>,
    sink: S,
    rx: RecordReceiver,
    retry_tx: WeakUnboundedSender<QueuedRecord>,
    /// Retries that could not be re-enqueued because every sender was gone.
    backlog: VecDeque<QueuedRecord>,
    reporter: Option<CancellationToken>,
    stats: WorkerStats,
}

impl<S: RecordSink> PersistenceWorker<S> {
    /// Create a worker consuming `rx`.
    ///
    /// `tx` is only used to obtain a weak handle for re-enqueuing; the worker
    /// does not keep the queue open on its own.
    pub fn new(
        config: WorkerConfig,
        store: Arc<MembershipStore>,
        sink: S,
        tx: &RecordSender,
        rx: RecordReceiver,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            rx,
            retry_tx: tx.downgrade(),
            backlog: VecDeque::new(),
            reporter: None,
            stats: WorkerStats::default(),
        }
    }

    /// Cancel `token` when the worker exits.
    #[must_use]
    pub fn with_reporter(mut self, token: CancellationToken) -> Self {
        self.reporter = Some(token);
        self
    }

    /// Statistics so far.
    #[must_use]
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Process one queued record.
    pub async fn process(&mut self, mut item: QueuedRecord) -> Processed {
        self.stats.processed += 1;

        match self.store.record(item.record, &mut self.sink).await {
            Ok(Classification::Unique) => {
                self.stats.unique += 1;
                debug!(record = %item.record, "Unique record persisted");
                Processed::Classified(Classification::Unique)
            }
            Ok(Classification::Duplicate) => {
                self.stats.duplicates += 1;
                Processed::Classified(Classification::Duplicate)
            }
            Err(DedupError::Sink { record, source }) => {
                self.stats.write_failures += 1;
                item.attempts += 1;

                if let Some(max) = self.config.max_write_retries {
                    if item.attempts > max {
                        let err = DedupError::WriteRetriesExhausted {
                            record,
                            attempts: item.attempts,
                        };
                        error!(error = %err, cause = %source, "Giving up on record");
                        self.stats.dropped += 1;
                        return Processed::Dropped;
                    }
                }

                warn!(
                    record = %record,
                    attempts = item.attempts,
                    error = %source,
                    "Write to output failed, record queued again"
                );
                self.requeue(item);
                Processed::Retried
            }
            Err(e) => {
                error!(error = %e, "Dropping record");
                self.stats.dropped += 1;
                Processed::Dropped
            }
        }
    }

    fn requeue(&mut self, item: QueuedRecord) {
        let sent = self
            .retry_tx
            .upgrade()
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false);
        if !sent {
            self.backlog.push_back(item);
        }
    }

    /// Run until the queue is drained after `stop`, or until `interrupt`.
    ///
    /// # Errors
    /// Returns an error if the sink cannot be closed cleanly.
    pub async fn run(
        mut self,
        stop: CancellationToken,
        interrupt: CancellationToken,
    ) -> Result<WorkerStats> {
        info!("Reading records from hand-off queue");
        let mut draining = false;

        let exit = loop {
            let next = if draining {
                tokio::select! {
                    biased;
                    _ = interrupt.cancelled() => break WorkerExit::Interrupted,
                    item = self.rx.recv() => item,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = interrupt.cancelled() => break WorkerExit::Interrupted,
                    _ = stop.cancelled() => {
                        info!("Stop requested, draining hand-off queue");
                        draining = true;
                        continue;
                    }
                    item = self.rx.recv() => item,
                }
            };

            match next.or_else(|| self.backlog.pop_front()) {
                Some(item) => {
                    self.process(item).await;
                }
                None => break WorkerExit::Drained,
            }
        };

        self.finish(exit).await
    }

    async fn finish(mut self, exit: WorkerExit) -> Result<WorkerStats> {
        self.stats.exit = exit;

        if exit == WorkerExit::Interrupted {
            info!("Persistence worker has been interrupted");
            self.rx.close();
            let mut abandoned = self.backlog.len() as u64;
            while self.rx.try_recv().is_ok() {
                abandoned += 1;
            }
            self.stats.abandoned = abandoned;
            if abandoned > 0 {
                warn!(abandoned, "Records left unprocessed in hand-off queue");
            }
        } else {
            info!("Hand-off queue drained");
        }

        if let Some(reporter) = self.reporter.take() {
            reporter.cancel();
        }

        let closed = self.sink.close().await;
        info!(
            processed = self.stats.processed,
            unique = self.stats.unique,
            duplicates = self.stats.duplicates,
            "Persistence worker stopped"
        );
        closed?;

        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::MemorySink;

    fn rec(value: u32) -> Record {
        Record::new(value).unwrap()
    }

    fn worker(
        sink: MemorySink,
        config: WorkerConfig,
    ) -> (PersistenceWorker<MemorySink>, RecordSender) {
        let store = Arc::new(MembershipStore::with_capacity(10_000));
        let (tx, rx) = handoff_queue();
        (PersistenceWorker::new(config, store, sink, &tx, rx), tx)
    }

    #[tokio::test]
    async fn test_process_unique_and_duplicate() {
        let (mut worker, _tx) = worker(MemorySink::new(), WorkerConfig::default());

        assert_eq!(
            worker.process(rec(5).into()).await,
            Processed::Classified(Classification::Unique)
        );
        assert_eq!(
            worker.process(rec(5).into()).await,
            Processed::Classified(Classification::Duplicate)
        );
        assert_eq!(worker.stats().unique, 1);
        assert_eq!(worker.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_requeued() {
        let (mut worker, tx) = worker(MemorySink::new().failing(2), WorkerConfig::default());
        tx.send(rec(1).into()).unwrap();
        tx.send(rec(2).into()).unwrap();
        drop(tx);

        let stats = worker.run_to_completion_for_test().await;

        // Both records eventually land, retries went to the back of the queue.
        assert_eq!(stats.unique, 2);
        assert_eq!(stats.write_failures, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.exit, WorkerExit::Drained);
    }

    #[tokio::test]
    async fn test_bounded_retries_drop_record() {
        let config = WorkerConfig::default().with_max_write_retries(1);
        let (mut worker, _tx) = worker(MemorySink::new().failing(5), config);

        assert_eq!(worker.process(rec(9).into()).await, Processed::Retried);
        let requeued = worker.rx.recv().await.unwrap();
        assert_eq!(requeued.attempts, 1);

        assert_eq!(worker.process(requeued).await, Processed::Dropped);
        assert_eq!(worker.stats().dropped, 1);
        assert!(!worker.store.contains(rec(9)).await);
    }

    #[tokio::test]
    async fn test_requeue_without_senders_uses_backlog() {
        let (mut worker, tx) = worker(MemorySink::new().failing(1), WorkerConfig::default());
        drop(tx);

        assert_eq!(worker.process(rec(3).into()).await, Processed::Retried);
        assert_eq!(worker.backlog.len(), 1);

        let stats = worker.run_to_completion_for_test().await;
        assert_eq!(stats.unique, 1);
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let (worker, tx) = worker(MemorySink::new(), WorkerConfig::default());
        let store = Arc::clone(&worker.store);
        for i in 0..100 {
            tx.send(rec(i % 60).into()).unwrap();
        }

        let stop = CancellationToken::new();
        let interrupt = CancellationToken::new();
        let handle = tokio::spawn(worker.run(stop.clone(), interrupt));

        stop.cancel();
        drop(tx);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.exit, WorkerExit::Drained);
        assert_eq!(stats.processed, 100);
        assert_eq!(stats.unique, 60);
        assert_eq!(stats.duplicates, 40);
        assert_eq!(store.snapshot().await.unique_total, 60);
    }

    #[tokio::test]
    async fn test_interrupt_abandons_queue_and_cancels_reporter() {
        let (worker, tx) = worker(MemorySink::new(), WorkerConfig::default());
        let reporter = CancellationToken::new();
        let worker = worker.with_reporter(reporter.clone());

        let stop = CancellationToken::new();
        let interrupt = CancellationToken::new();
        interrupt.cancel();
        for i in 0..10 {
            tx.send(rec(i).into()).unwrap();
        }

        let stats = worker.run(stop, interrupt).await.unwrap();
        assert_eq!(stats.exit, WorkerExit::Interrupted);
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.abandoned, 10);
        assert!(reporter.is_cancelled());
    }

    #[tokio::test]
    async fn test_blocked_worker_is_interrupted() {
        let (worker, _tx) = worker(MemorySink::new(), WorkerConfig::default());
        let stop = CancellationToken::new();
        let interrupt = CancellationToken::new();
        let handle = tokio::spawn(worker.run(stop.clone(), interrupt.clone()));

        // A live sender keeps the queue open, so stop alone cannot finish.
        stop.cancel();
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        interrupt.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.exit, WorkerExit::Interrupted);
    }

    impl PersistenceWorker<MemorySink> {
        async fn run_to_completion_for_test(&mut self) -> WorkerStats {
            while let Some(item) = self.rx.recv().await.or_else(|| self.backlog.pop_front()) {
                self.process(item).await;
            }
            self.stats.clone()
        }
    }
}
