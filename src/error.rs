//! Error types for pivot-netstack
//!
//! Construction failures are fatal and carry the OS error that caused them.
//! Runtime dispatch errors (`PoolClosed`, `PoolUnset`, `PoolFull`) are local to
//! the forwarder that hit them and are only logged.

use std::io;

use thiserror::Error;

use crate::request::ConnectionRequest;

/// Top-level error type for the network stack
#[derive(Debug, Error)]
pub enum StackError {
    /// The virtual interface could not be opened
    #[error("Failed to open interface {name}: {source}")]
    InterfaceOpenFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The packet engine refused the interface configuration
    #[error("Failed to create NIC: {0}")]
    NicCreationFailed(String),

    /// The pool has been closed and accepts no more requests
    #[error("Connection pool is closed")]
    PoolClosed,

    /// No pool is attached to the stack
    #[error("No connection pool is set")]
    PoolUnset,

    /// The pool reached its capacity
    #[error("Connection pool is full ({capacity} pending requests)")]
    PoolFull { capacity: usize },

    /// Releasing the interface descriptor failed
    #[error("Failed to destroy network stack: {0}")]
    DestroyFailure(#[source] io::Error),

    /// The request was already accepted or terminated
    #[error("Connection request already completed")]
    RequestCompleted,

    /// The stack driver is gone (destroyed or crashed)
    #[error("Network stack is stopped")]
    StackStopped,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StackError {
    /// Check if this error is recoverable (the caller may retry later)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InterfaceOpenFailed { .. }
            | Self::NicCreationFailed(_)
            | Self::DestroyFailure(_)
            | Self::StackStopped
            | Self::RequestCompleted
            | Self::PoolClosed => false,
            Self::PoolUnset | Self::PoolFull { .. } => true,
            Self::Config(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Build an `InterfaceOpenFailed` error
    pub fn interface_open(name: impl Into<String>, source: io::Error) -> Self {
        Self::InterfaceOpenFailed {
            name: name.into(),
            source,
        }
    }

    /// Build a `NicCreationFailed` error
    pub fn nic_creation(reason: impl Into<String>) -> Self {
        Self::NicCreationFailed(reason.into())
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Error returned by [`ConnectionPool::add`](crate::pool::ConnectionPool::add)
///
/// The rejected request is handed back so the caller can terminate it
/// instead of leaking its transport state.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct AddError {
    /// Why the pool refused the request
    pub reason: StackError,
    /// The request that was not queued
    pub request: ConnectionRequest,
}

impl AddError {
    /// Split into the reason and the returned request
    #[must_use]
    pub fn into_parts(self) -> (StackError, ConnectionRequest) {
        (self.reason, self.request)
    }
}

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, StackError>;
