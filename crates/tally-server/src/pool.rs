//! Task pool with two-phase shutdown.
//!
//! Every long-running task of the server (connection handlers, the
//! persistence worker, the reporter) is spawned into one [`TaskPool`].
//! [`TaskPool::shutdown`] then runs the termination protocol:
//!
//! 1. set `stop` and wait up to `grace` for all tasks to finish
//! 2. set `interrupt` and wait up to `force`
//! 3. abort whatever is left and report it
//!
//! The pool never blocks longer than `grace + force`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownSignal;

/// How the pool terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Every task finished after the cooperative stop.
    Graceful,
    /// Some tasks needed the forceful interrupt.
    Forced,
    /// Tasks were still running after both timeouts and were aborted.
    Unterminated {
        /// Number of tasks still alive when the pool gave up.
        remaining: usize,
    },
}

impl ShutdownOutcome {
    /// Whether every task finished on its own.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        !matches!(self, Self::Unterminated { .. })
    }
}

/// What a pool shutdown produced.
#[derive(Debug)]
pub struct PoolShutdown<T> {
    /// How the pool terminated.
    pub outcome: ShutdownOutcome,
    /// Outputs of tasks collected during shutdown, in completion order.
    pub outputs: Vec<T>,
    /// Tasks that panicked.
    pub panicked: usize,
}

/// Set of spawned tasks sharing one [`ShutdownSignal`].
pub struct TaskPool<T> {
    tasks: JoinSet<T>,
    signal: ShutdownSignal,
    outputs: Vec<T>,
    panicked: usize,
}

impl<T: Send + 'static> TaskPool<T> {
    /// Create an empty pool driven by `signal`.
    #[must_use]
    pub fn new(signal: ShutdownSignal) -> Self {
        Self {
            tasks: JoinSet::new(),
            signal,
            outputs: Vec::new(),
            panicked: 0,
        }
    }

    /// Spawn a task into the pool.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Number of tasks not yet collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Collect tasks that already finished, without waiting.
    ///
    /// Outputs are handed to `absorb` and not kept by the pool, so a
    /// long-running pool does not grow with every finished task.
    pub fn reap(&mut self, mut absorb: impl FnMut(T)) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Some(output) = self.unwrap_joined(joined) {
                absorb(output);
            }
        }
    }

    fn unwrap_joined(&mut self, joined: std::result::Result<T, JoinError>) -> Option<T> {
        match joined {
            Ok(output) => Some(output),
            Err(e) if e.is_panic() => {
                error!(error = %e, "Task panicked");
                self.panicked += 1;
                None
            }
            Err(e) => {
                debug!(error = %e, "Task cancelled");
                None
            }
        }
    }

    fn collect(&mut self, joined: std::result::Result<T, JoinError>) {
        if let Some(output) = self.unwrap_joined(joined) {
            self.outputs.push(output);
        }
    }

    async fn join_within(&mut self, limit: Duration) -> bool {
        let joined = tokio::time::timeout(limit, async {
            while let Some(joined) = self.tasks.join_next().await {
                self.collect(joined);
            }
        })
        .await;
        joined.is_ok()
    }

    /// Run the two-phase termination protocol.
    ///
    /// Outputs of tasks that finish from here on are returned in
    /// [`PoolShutdown::outputs`].
    pub async fn shutdown(mut self, grace: Duration, force: Duration) -> PoolShutdown<T> {
        info!(
            active = self.tasks.len(),
            grace_secs = grace.as_secs_f64(),
            "Stopping tasks"
        );
        self.signal.stop();

        let outcome = if self.join_within(grace).await {
            info!("All tasks stopped");
            ShutdownOutcome::Graceful
        } else {
            warn!(
                active = self.tasks.len(),
                force_secs = force.as_secs_f64(),
                "Tasks did not stop in time, interrupting"
            );
            self.signal.interrupt();

            if self.join_within(force).await {
                info!("All tasks stopped after interrupt");
                ShutdownOutcome::Forced
            } else {
                let remaining = self.tasks.len();
                error!(remaining, "Tasks did not terminate");
                self.tasks.abort_all();
                ShutdownOutcome::Unterminated { remaining }
            }
        };

        PoolShutdown {
            outcome,
            outputs: self.outputs,
            panicked: self.panicked,
        }
    }
}
