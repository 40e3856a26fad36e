//! # tally-server
//!
//! TCP ingest server for 9-digit records.
//!
//! Clients connect, send one record per line and are served by a
//! [`ConnectionHandler`] each, with at most `max_clients` connected at a
//! time. Valid records go through the hand-off queue to the persistence
//! worker from `tally-dedup`, which writes every distinct value once to the
//! output artifact. A client sending `terminate` shuts the whole server
//! down.
//!
//! ## Example
//!
//! ```ignore
//! use tally_server::{Server, ServerConfig};
//!
//! let config = ServerConfig::new().with_port(4000).with_max_clients(5);
//! let server = Server::bind(config).await?;
//! let summary = server.run().await?;
//! println!("{} unique records", summary.unique_total);
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod pool;
pub mod shutdown;

pub use config::{ServerConfig, DEFAULT_MAX_CLIENTS, DEFAULT_PORT, DEFAULT_SHUTDOWN_TIMEOUT};
pub use connection::{CloseReason, ConnectionHandler, ConnectionOutcome, Dispatch};
pub use error::{Result, ServerError};
pub use listener::{Server, ServerHandle, ShutdownSummary};
pub use pool::{PoolShutdown, ShutdownOutcome, TaskPool};
pub use shutdown::ShutdownSignal;
