//! Shutdown signalling shared by the listener, handlers and workers.
//!
//! Three one-shot flags, each a [`CancellationToken`]:
//!
//! | Flag        | Set by                      | Observed by                    |
//! |-------------|-----------------------------|--------------------------------|
//! | `requested` | a handler seeing the keyword | the accept loop              |
//! | `stop`      | the pool, phase 1           | handlers, persistence worker   |
//! | `interrupt` | the pool, phase 2           | handlers, worker, reporter     |
//!
//! Flags only ever go from unset to set. `interrupt` implies `stop`, and
//! `stop` implies `requested`.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cloneable handle to the shutdown flags.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: CancellationToken,
    stop: CancellationToken,
    interrupt: CancellationToken,
}

impl ShutdownSignal {
    /// Create a signal with no flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the server to shut down. Idempotent.
    pub fn request(&self) {
        if !self.requested.is_cancelled() {
            info!("Shutdown requested");
            self.requested.cancel();
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.requested.cancelled().await;
    }

    /// Phase 1: ask every task to finish cooperatively.
    pub fn stop(&self) {
        self.request();
        self.stop.cancel();
    }

    /// Whether phase 1 has started.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Phase 2: cancel blocking operations in every task.
    pub fn interrupt(&self) {
        self.stop();
        self.interrupt.cancel();
    }

    /// Whether phase 2 has started.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Token cancelled on phase 1.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Token cancelled on phase 2.
    #[must_use]
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_start_unset() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_requested());
        assert!(!signal.is_stopping());
        assert!(!signal.is_interrupted());
    }

    #[test]
    fn test_interrupt_implies_stop_and_request() {
        let signal = ShutdownSignal::new();
        signal.interrupt();
        assert!(signal.is_requested());
        assert!(signal.is_stopping());
        assert!(signal.is_interrupted());
    }

    #[test]
    fn test_request_does_not_stop() {
        let signal = ShutdownSignal::new();
        signal.request();
        signal.request();
        assert!(signal.is_requested());
        assert!(!signal.is_stopping());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        let waiter = tokio::spawn(async move { other.requested().await });
        signal.request();
        waiter.await.unwrap();
        assert!(!signal.stop_token().is_cancelled());
    }
}
