//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::{DEFAULT_OUTPUT_PATH, RECORD_DOMAIN};
use tally_dedup::{WorkerConfig, DEFAULT_REPORT_INTERVAL};

use crate::error::{Result, ServerError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 4000;

/// Default ceiling on concurrently connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 5;

/// Default wait for each shutdown phase.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the ingest server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind. `0` picks an ephemeral port.
    pub port: u16,
    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
    /// Output artifact path.
    pub output_path: PathBuf,
    /// Period of the stats report.
    pub report_interval: Duration,
    /// How long to wait for tasks after a cooperative stop.
    pub shutdown_grace: Duration,
    /// How long to wait for tasks after a forceful interrupt.
    pub shutdown_force: Duration,
    /// Drop a record after this many failed writes. `None` retries forever.
    pub max_write_retries: Option<u32>,
    /// Size of the membership set. Values at or above it are rejected by the worker.
    pub membership_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            report_interval: DEFAULT_REPORT_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_TIMEOUT,
            shutdown_force: DEFAULT_SHUTDOWN_TIMEOUT,
            max_write_retries: None,
            membership_capacity: RECORD_DOMAIN as usize,
        }
    }
}

impl ServerConfig {
    /// Create config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind interface.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the listening port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client ceiling.
    #[must_use]
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Set the output artifact path.
    #[must_use]
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    /// Set the stats report period.
    #[must_use]
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Set both shutdown phase timeouts.
    #[must_use]
    pub fn with_shutdown_timeouts(mut self, grace: Duration, force: Duration) -> Self {
        self.shutdown_grace = grace;
        self.shutdown_force = force;
        self
    }

    /// Bound write retries per record.
    #[must_use]
    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = Some(retries);
        self
    }

    /// Shrink the membership set, mostly useful in tests.
    #[must_use]
    pub fn with_membership_capacity(mut self, capacity: usize) -> Self {
        self.membership_capacity = capacity;
        self
    }

    /// `host:port` string to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Worker threads for the runtime: one per client plus the persistence worker.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.max_clients + 1
    }

    /// Settings handed to the persistence worker.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_write_retries: self.max_write_retries,
        }
    }

    /// Check the configuration for values the server cannot run with.
    ///
    /// # Errors
    /// Returns [`ServerError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(ServerError::Config(
                "max_clients must be at least 1".to_string(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(ServerError::Config(
                "report_interval must be non-zero".to_string(),
            ));
        }
        if self.membership_capacity == 0 || self.membership_capacity > RECORD_DOMAIN as usize {
            return Err(ServerError::Config(format!(
                "membership_capacity must be within 1..={RECORD_DOMAIN}"
            )));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ServerError::Config("output_path is empty".to_string()));
        }
        Ok(())
    }
}
