// fault-core/src/error.rs
// Error taxonomy shared by the fault drivers, the manager and the proxy

use crate::resp::WireError;
use std::result;
use thiserror::Error;

/// Main error type for fault orchestration
#[derive(Error, Debug)]
pub enum FaultError {
    /// No driver registered under the requested name
    #[error("fault {name} not found")]
    NotFound { name: String },

    /// Driver enforces exactly-one-active and is already running
    #[error("{fault} fault already active")]
    Conflict { fault: String },

    /// Malformed control command or error reply from the injection proxy
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Control channel or upstream I/O failure
    #[error("Transport error: {operation} failed - {source}")]
    Transport {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// External tool invocation failed; carries the captured process output
    #[error("Operational error: `{command}` failed (output: {output})")]
    Operational { command: String, output: String },

    /// A fault parameter could not be interpreted
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for convenience
pub type Result<T> = result::Result<T, FaultError>;

impl FaultError {
    pub fn transport(operation: &str, source: std::io::Error) -> Self {
        FaultError::Transport {
            operation: operation.to_string(),
            source,
        }
    }

    pub fn not_found(name: &str) -> Self {
        FaultError::NotFound {
            name: name.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FaultError::Transport { .. } | FaultError::Timeout { .. }
        )
    }
}

impl From<WireError> for FaultError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(source) => FaultError::transport("proxy round-trip", source),
            WireError::Closed | WireError::UnexpectedEof => FaultError::transport(
                "proxy round-trip",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err.to_string()),
            ),
            other => FaultError::Protocol(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for FaultError {
    fn from(err: config::ConfigError) -> Self {
        FaultError::Config(err.to_string())
    }
}
