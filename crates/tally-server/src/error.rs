//! Error types for the ingest server.

use tally_core::TallyError;
use tally_dedup::DedupError;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed while the server was running.
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Listener address could not be read back.
    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),

    /// Persistence worker error
    #[error("Persistence error: {0}")]
    Dedup(#[from] DedupError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] TallyError),
}

impl ServerError {
    /// Shorthand for a bind failure on `addr`.
    pub(crate) fn bind(addr: impl std::fmt::Display, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

