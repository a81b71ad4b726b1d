//! Custom error types for the collector.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failure modes of an unattended station, from configuration problems to
//! instrument channels that drop out and archive uploads that fail.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups failures by how the rest of the system reacts to them:
//!
//! - **`Config` / `Configuration`**: the settings file could not be loaded, or loaded
//!   but is semantically invalid. Fatal at startup.
//! - **`CommandRejected`**: an instrument answered a configuration command with a
//!   rejection. Logged as a warning; the handshake continues.
//! - **`InstrumentFault`**: an instrument reported an unrecoverable fault while being
//!   configured. The worker drops back to `Disconnected` and retries later.
//! - **`Io` / `Timeout` / `ConnectionClosed` / `NotConnected`**: transient channel
//!   failures. They trigger reconnect with backoff and never stop a worker.
//! - **`Parse`**: one malformed response. Only that response is discarded.
//! - **`Staging`**: an interval file could not be written. The records go back to
//!   the buffer and the next staging cycle retries.
//! - **`Transfer` / `Authentication`**: the archive upload failed. The file stays
//!   pending and is retried with backoff.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Instrument rejected command {command:?}: {response:?}")]
    CommandRejected { command: String, response: String },

    #[error("Instrument fault on command {command:?}: {response:?}")]
    InstrumentFault { command: String, response: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {after:?} during {operation}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Channel not connected")]
    NotConnected,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Worker for instrument '{0}' has stopped")]
    WorkerStopped(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Build a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        DaqError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Whether the failure is a channel or network hiccup that a reconnect
    /// (or a later retry) may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::Io(_)
                | DaqError::Timeout { .. }
                | DaqError::ConnectionClosed
                | DaqError::NotConnected
                | DaqError::Transfer(_)
        )
    }

    /// Failures that should stop the process at startup.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_) | DaqError::Configuration(_) | DaqError::Authentication(_)
        )
    }
}
