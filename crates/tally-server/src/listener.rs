//! Admission-controlled listener.
//!
//! The accept loop takes one admission permit before every `accept()`, so
//! at most `max_clients` handlers run at once and further clients wait in
//! the kernel backlog. When a handler sees the shutdown keyword the loop
//! exits, the listening socket is closed and the task pool runs its
//! two-phase termination.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tally_core::FileSink;
use tally_dedup::{
    handoff_queue, DedupError, IntervalReport, MembershipStore, PersistenceWorker, Reporter, WorkerExit,
    WorkerStats,
};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{CloseReason, ConnectionHandler, ConnectionOutcome};
use crate::error::{Result, ServerError};
use crate::pool::{ShutdownOutcome, TaskPool};
use crate::shutdown::ShutdownSignal;

/// Output of a task in the server pool.
enum TaskOutput {
    Connection(ConnectionOutcome),
    Worker(tally_dedup::Result<WorkerStats>),
    Reporter(IntervalReport),
}

/// Running fold of task outputs. Finished connections are folded in as
/// they are reaped so nothing per connection is kept.
#[derive(Default)]
struct RunTally {
    protocol_violations: u64,
    worker: Option<WorkerStats>,
    worker_error: Option<DedupError>,
    final_report: Option<IntervalReport>,
}

impl RunTally {
    fn absorb(&mut self, output: TaskOutput) {
        match output {
            TaskOutput::Connection(conn) => {
                if conn.reason == CloseReason::ProtocolViolation {
                    self.protocol_violations += 1;
                }
            }
            TaskOutput::Worker(Ok(stats)) => self.worker = Some(stats),
            TaskOutput::Worker(Err(e)) => {
                error!(error = %e, "Persistence worker failed");
                self.worker_error = Some(e);
            }
            TaskOutput::Reporter(report) => self.final_report = Some(report),
        }
    }
}

/// Final account of a server run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSummary {
    /// Address the server listened on.
    pub local_addr: SocketAddr,
    /// How the task pool terminated.
    pub outcome: ShutdownOutcome,
    /// Connections accepted over the whole run.
    pub connections_accepted: u64,
    /// Connections closed for sending an invalid token.
    pub protocol_violations: u64,
    /// Unique records persisted.
    pub unique_total: u64,
    /// Failed writes to the output artifact.
    pub write_failures: u64,
    /// Records given up on after exhausting write retries.
    pub dropped_records: u64,
    /// Records left in the hand-off queue on interrupt.
    pub abandoned_records: u64,
    /// How the persistence worker ended, if it ended.
    pub worker_exit: Option<WorkerExit>,
    /// Last stats line emitted by the reporter.
    pub final_report: Option<IntervalReport>,
    /// Tasks that panicked.
    pub panicked_tasks: usize,
    /// Wall time from `run` to the end of shutdown.
    pub elapsed_secs: f64,
}

/// Cloneable view of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    max_clients: usize,
    permits: Arc<Semaphore>,
    accepted: Arc<AtomicU64>,
    signal: ShutdownSignal,
    store: Arc<MembershipStore>,
}

impl ServerHandle {
    /// Address the server listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configured client ceiling.
    #[must_use]
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Admission permits not currently held.
    ///
    /// The accept loop holds one permit while it waits for the next client.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Ask the server to shut down, as if a client sent the keyword.
    pub fn request_shutdown(&self) {
        self.signal.request();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal.is_requested()
    }

    /// Current counters, without resetting the interval.
    pub async fn snapshot(&self) -> IntervalReport {
        self.store.snapshot().await
    }
}

/// A bound, not yet running server.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    sink: FileSink,
    permits: Arc<Semaphore>,
    accepted: Arc<AtomicU64>,
    signal: ShutdownSignal,
    store: Arc<MembershipStore>,
}

impl Server {
    /// Validate `config`, prepare the output artifact and bind the listener.
    ///
    /// # Errors
    /// - [`ServerError::Config`] for an invalid configuration
    /// - [`ServerError::Core`] if the output artifact cannot be created
    /// - [`ServerError::Bind`] if the address cannot be bound
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let sink = FileSink::create(&config.output_path).await?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::bind(&addr, e))?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        info!(
            addr = %local_addr,
            max_clients = config.max_clients,
            output = %config.output_path.display(),
            "Server listening"
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_clients)),
            store: Arc::new(MembershipStore::with_capacity(config.membership_capacity)),
            accepted: Arc::new(AtomicU64::new(0)),
            signal: ShutdownSignal::new(),
            config,
            listener,
            local_addr,
            sink,
        })
    }

    /// Address the server listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for observing and stopping the server from outside.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            max_clients: self.config.max_clients,
            permits: Arc::clone(&self.permits),
            accepted: Arc::clone(&self.accepted),
            signal: self.signal.clone(),
            store: Arc::clone(&self.store),
        }
    }

    /// Serve clients until shutdown is requested, then terminate every task.
    ///
    /// # Errors
    /// - [`ServerError::Accept`] if accepting failed while not shutting down
    /// - [`ServerError::Dedup`] if the output artifact could not be closed
    ///
    /// In both cases the pool is still shut down before returning.
    pub async fn run(self) -> Result<ShutdownSummary> {
        let Self {
            config,
            listener,
            local_addr,
            sink,
            permits,
            accepted,
            signal,
            store,
        } = self;
        let started = Instant::now();

        let (tx, rx) = handoff_queue();
        let mut pool = TaskPool::new(signal.clone());
        let mut tally = RunTally::default();

        let reporter_token = signal.interrupt_token().child_token();
        let reporter = Reporter::new(Arc::clone(&store), config.report_interval);
        let token = reporter_token.clone();
        pool.spawn(async move { TaskOutput::Reporter(reporter.run(token).await) });

        let worker =
            PersistenceWorker::new(config.worker_config(), Arc::clone(&store), sink, &tx, rx)
                .with_reporter(reporter_token);
        let (stop, interrupt) = (signal.stop_token(), signal.interrupt_token());
        pool.spawn(async move { TaskOutput::Worker(worker.run(stop, interrupt).await) });

        let accept_result: Result<()> = loop {
            let permit = tokio::select! {
                biased;
                _ = signal.requested() => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let (stream, peer) = tokio::select! {
                biased;
                _ = signal.requested() => break Ok(()),
                conn = listener.accept() => match conn {
                    Ok(pair) => pair,
                    Err(e) if signal.is_requested() => {
                        debug!(error = %e, "Accept failed during shutdown");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        break Err(ServerError::Accept(e));
                    }
                },
            };

            accepted.fetch_add(1, Ordering::Relaxed);
            info!(
                peer = %peer,
                available = permits.available_permits(),
                "Connection accepted"
            );

            pool.reap(|output| tally.absorb(output));
            let handler = ConnectionHandler::new(stream, peer, tx.clone(), signal.clone(), permit);
            pool.spawn(async move { TaskOutput::Connection(handler.run().await) });
        };

        drop(listener);
        permits.close();
        drop(tx);
        signal.request();
        info!(addr = %local_addr, "Listener closed, shutting down");

        let done = pool
            .shutdown(config.shutdown_grace, config.shutdown_force)
            .await;

        for output in done.outputs {
            tally.absorb(output);
        }

        let worker = tally.worker.as_ref();
        let mut summary = ShutdownSummary {
            local_addr,
            outcome: done.outcome,
            connections_accepted: accepted.load(Ordering::Relaxed),
            protocol_violations: tally.protocol_violations,
            unique_total: worker.map_or(0, |w| w.unique),
            write_failures: worker.map_or(0, |w| w.write_failures),
            dropped_records: worker.map_or(0, |w| w.dropped),
            abandoned_records: worker.map_or(0, |w| w.abandoned),
            worker_exit: worker.map(|w| w.exit),
            final_report: tally.final_report,
            panicked_tasks: done.panicked,
            elapsed_secs: 0.0,
        };
        if summary.worker_exit.is_none() {
            if let Some(report) = summary.final_report {
                summary.unique_total = report.unique_total;
            }
        }
        summary.elapsed_secs = started.elapsed().as_secs_f64();

        match summary.outcome {
            ShutdownOutcome::Unterminated { remaining } => {
                warn!(remaining, "Server stopped with tasks still running");
            }
            _ => info!(
                unique_total = summary.unique_total,
                connections = summary.connections_accepted,
                "Server stopped"
            ),
        }

        accept_result?;
        if let Some(e) = tally.worker_error {
            return Err(e.into());
        }
        Ok(summary)
    }
}
