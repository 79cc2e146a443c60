//! Error types for the fleet core
//!
//! Every failure the core can produce is a variant of [`Error`]. Each variant
//! maps onto a stable [`ErrorKind`] so the layer above can decide whether to
//! retry, fail the user request, or route to a different instance.
//!
//! # Error Taxonomy
//!
//! ```text
//! Error
//! ├── Supervisor: PortAllocation, MaxInstances, Spawn, NotFound, NotRunning
//! ├── RPC:        Connection, Disconnected, Timeout, Remote, SessionNotFound, Cancelled
//! ├── Routing:    NoAvailableInstance, UnknownRuntime
//! └── Ambient:    Protocol, Config, Io, Serialization
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the fleet core.
#[derive(Debug, Error)]
pub enum Error {
    /// No free port could be bound in the configured range.
    #[error("No free port in range {start}-{end} after {attempts} attempts")]
    PortAllocation {
        /// First port of the range
        start: u16,
        /// Last port of the range (inclusive)
        end: u16,
        /// Number of bind attempts made
        attempts: usize,
    },

    /// The supervisor is already managing its maximum number of processes.
    #[error("Maximum concurrent instances reached: {limit}")]
    MaxInstances {
        /// Configured limit
        limit: usize,
    },

    /// The worker failed to start or never became ready.
    #[error("Failed to spawn worker: {reason}")]
    Spawn {
        /// Human readable reason
        reason: String,
        /// Underlying I/O error when the fork itself failed
        #[source]
        source: Option<std::io::Error>,
    },

    /// Unknown process, instance or session identifier.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// Identifier that was not found
        id: String,
    },

    /// The process exists but is not in the `running` state.
    #[error("Process {id} is not running (state: {state})")]
    NotRunning {
        /// Process identifier
        id: String,
        /// Current state
        state: String,
    },

    /// The worker does not know the session.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Connecting to a worker endpoint failed after all retries.
    #[error("Failed to connect to {endpoint} after {attempts} attempts: {reason}")]
    Connection {
        /// Endpoint address
        endpoint: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// The connection was closed while the call was pending.
    #[error("Disconnected from worker: {0}")]
    Disconnected(String),

    /// The call did not complete within its deadline.
    #[error("Operation timed out after {after:?}: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The worker explicitly reported a failure.
    #[error("Worker error {code}: {message}")]
    Remote {
        /// Worker error code
        code: i64,
        /// Worker error message
        message: String,
        /// Optional structured details
        data: Option<serde_json::Value>,
    },

    /// The call was interrupted because its process or session was killed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Selection found nothing routable and auto-spawn did not help.
    #[error("No available instance: {0}")]
    NoAvailableInstance(String),

    /// The runtime identifier is not registered.
    #[error("Unknown runtime: {0}")]
    UnknownRuntime(String),

    /// Malformed frame or protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable classification of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PortAllocation,
    MaxInstances,
    Spawn,
    NotFound,
    NotRunning,
    SessionNotFound,
    Connection,
    Disconnected,
    Timeout,
    Remote,
    Cancelled,
    NoAvailableInstance,
    UnknownRuntime,
    Protocol,
    Config,
    Io,
    Serialization,
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Spawn`] without an I/O source
    pub fn spawn(reason: impl Into<String>) -> Self {
        Self::Spawn {
            reason: reason.into(),
            source: None,
        }
    }

    /// Convenience constructor for [`Error::Timeout`]
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PortAllocation { .. } => ErrorKind::PortAllocation,
            Self::MaxInstances { .. } => ErrorKind::MaxInstances,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NoAvailableInstance(_) => ErrorKind::NoAvailableInstance,
            Self::UnknownRuntime(_) => ErrorKind::UnknownRuntime,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Transport-level failures that a bounded reconnect may fix.
    ///
    /// Remote failures are never retryable: the worker already answered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Disconnected | ErrorKind::Connection
        )
    }

    /// Whether this failure should count against the instance's circuit breaker
    pub fn counts_as_instance_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Disconnected | ErrorKind::Connection | ErrorKind::Io
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinct() {
        let timeout = Error::timeout("send_message", Duration::from_secs(1));
        let cancelled = Error::Cancelled("session killed".into());
        let remote = Error::Remote {
            code: -32000,
            message: "boom".into(),
            data: None,
        };

        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(remote.kind(), ErrorKind::Remote);
    }

    #[test]
    fn test_remote_errors_are_not_retryable() {
        let remote = Error::Remote {
            code: 1,
            message: "tool failed".into(),
            data: None,
        };
        assert!(!remote.is_retryable());
        assert!(!remote.counts_as_instance_failure());

        assert!(Error::Disconnected("eof".into()).is_retryable());
        assert!(!Error::Cancelled("killed".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::PortAllocation {
            start: 9000,
            end: 9000,
            attempts: 1,
        };
        assert_eq!(err.to_string(), "No free port in range 9000-9000 after 1 attempts");

        let err = Error::not_found("process", "abc");
        assert_eq!(err.to_string(), "process not found: abc");
    }
}
