//! Error types for optilink.
//!
//! One enum covers the whole core: connection and framing failures raised by the
//! transport, timeouts, server-reported command failures, listener and process
//! start-up failures, and use of a disposed session.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the optilink core.
#[derive(Debug, Error)]
pub enum OslError {
    // Connection errors
    #[error("Cannot {operation}: connection is not established")]
    NotConnected { operation: &'static str },

    #[error("Connection is already established")]
    AlreadyConnected,

    #[error("Connection could not be established to host {host} and port {port}")]
    ConnectionRefused { host: String, port: u16 },

    // Framing errors
    #[error("The empty message has been received")]
    EmptyResponse,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // Timeouts
    #[error("Timeout has expired after {0:?}")]
    Timeout(Duration),

    #[error("Waiting for {phase} timed out")]
    WaitTimedOut { phase: &'static str },

    // Server communication
    #[error("An error occurred while communicating with the server: {source}")]
    Communication {
        #[source]
        source: Box<OslError>,
    },

    #[error("Command failed: {message}")]
    Command { message: String },

    // Listener errors
    #[error("Cannot bind push listener: no free port in range {first}-{last}")]
    CannotBindListener { first: u16, last: u16 },

    // Local server process errors
    #[error("Server process start failed (returncode: {exit_code:?}): {message}")]
    ServerStart {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Server process start failed due to licensing issues (returncode: {exit_code})")]
    Licensing { exit_code: i32 },

    #[error("Server process start timed out")]
    StartTimedOut,

    #[error("Server process is already started")]
    AlreadyStarted,

    // Session errors
    #[error("Cannot {operation}, instance was already disposed")]
    Disposed { operation: &'static str },

    #[error("Server is not started")]
    NotStarted,

    #[error("Invalid server version string: \"{0}\"")]
    InvalidVersion(String),

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for optilink operations.
pub type Result<T> = std::result::Result<T, OslError>;

impl From<std::io::Error> for OslError {
    fn from(err: std::io::Error) -> Self {
        OslError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for OslError {
    fn from(err: serde_json::Error) -> Self {
        OslError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl OslError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        OslError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        OslError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether a wall-clock deadline expired, either in the transport or while
    /// waiting on a push notification.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OslError::Timeout(_) | OslError::WaitTimedOut { .. })
    }

    /// Whether the server rejected a lease operation because it no longer
    /// knows the listener.
    pub fn is_no_such_listener(&self) -> bool {
        match self {
            OslError::Command { message } => message.contains("No such listener"),
            _ => false,
        }
    }

    /// Whether this error should trigger another request attempt.
    ///
    /// Only timeouts are retried; a failed command is never resent because the
    /// server may already have applied it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OslError::Timeout(_))
    }
}
