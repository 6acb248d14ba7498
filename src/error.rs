//! Error types for the rdbha library.
//!
//! Every backend operation reports failures through [`Error`]. The engine-agnostic
//! classification an orchestrator acts upon is available through [`Error::kind`].

use std::fmt;
use thiserror::Error;

use crate::database::Role;

/// Primary error type encompassing all possible errors in the library.
#[derive(Error, Debug)]
pub enum Error {
    /// No live connection resource exists or the engine is unreachable
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connected, but an introspection or mutation query errored
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The operation has no valid implementation on this engine or version
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Bad input parameters, detected before any network I/O
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The engine reports a different role than the caller expected
    #[error("Role assertion failed: expected {expected}, found {actual}")]
    RoleAssertionFailed {
        /// Role the caller required
        expected: Role,
        /// Role the engine reported
        actual: Role,
    },

    /// A bounded operation ran out of time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A result row has no column with the requested name
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// A result value could not be converted to the requested type
    #[error("Type mismatch in column {column}: expected {expected}")]
    TypeMismatch {
        /// Column name
        column: String,
        /// Requested Rust type
        expected: &'static str,
    },
}

/// Engine-agnostic error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::ConnectionFailed`]
    ConnectionFailed,
    /// See [`Error::QueryFailed`]; row decoding failures are reported here as well
    QueryFailed,
    /// See [`Error::NotSupported`]
    NotSupported,
    /// See [`Error::ConfigurationInvalid`]
    ConfigurationInvalid,
    /// See [`Error::RoleAssertionFailed`]
    RoleAssertionFailed,
    /// See [`Error::Timeout`]
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::QueryFailed => "query_failed",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::ConfigurationInvalid => "configuration_invalid",
            ErrorKind::RoleAssertionFailed => "role_assertion_failed",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::ConnectionFailed(msg.into())
    }

    /// Creates a new query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Error::QueryFailed(msg.into())
    }

    /// Creates a new not-supported error with the given message.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Creates a new configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::ConfigurationInvalid(msg.into())
    }

    /// Creates a new timeout error with the given message.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Returns the engine-agnostic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::QueryFailed(_) | Error::ColumnNotFound(_) | Error::TypeMismatch { .. } => {
                ErrorKind::QueryFailed
            }
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::ConfigurationInvalid(_) => ErrorKind::ConfigurationInvalid,
            Error::RoleAssertionFailed { .. } => ErrorKind::RoleAssertionFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether the condition is transient. Retry pacing is left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailed | ErrorKind::QueryFailed | ErrorKind::Timeout
        )
    }
}
