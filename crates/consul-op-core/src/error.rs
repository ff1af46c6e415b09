//! Error types for consul-op-core
//!
//! Every operation returns exactly one of these kinds. Lock cancellation is not
//! an error: it is reported as [`crate::LockOutcome::Cancelled`].

use thiserror::Error;

/// Core error type for consul-op operations
///
/// `Clone` so the result of the one-shot connect can be replayed to every
/// later caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Key (or other named resource) has no entry in the backend
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend handle could not be constructed; the operator is unusable
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation ran before `connect()` completed
    #[error("Not connected: call connect() before using the operator")]
    NotConnected,

    /// Transport or consistency error reported by the backend
    #[error("Backend error during {context}: {message}")]
    Backend { context: String, message: String },

    /// Release of a lock name this operator never tried to acquire
    #[error("Lock '{0}' was never acquired through this operator")]
    LockNotAcquired(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed configuration or response data
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Filesystem errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl Error {
    /// Create a backend error with the operation it happened in.
    pub fn backend(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// `true` for the expected, non-fatal "no such key" outcome.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns the process exit code for this error.
    ///
    /// - 1: configuration or input problems
    /// - 2: backend, connection and IO failures
    /// - 3: not found
    /// - 4: misuse of the operator (not connected, release without acquire)
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) | Self::ParseError(_) => 1,
            Self::ConnectionFailed(_) | Self::Backend { .. } | Self::IoError(_) => 2,
            Self::NotFound(_) => 3,
            Self::NotConnected | Self::LockNotAcquired(_) => 4,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

/// Result type alias for consul-op-core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = Error::backend("kv get 'a/b'", "500 Internal Server Error");
        assert_eq!(
            err.to_string(),
            "Backend error during kv get 'a/b': 500 Internal Server Error"
        );
    }

    #[test]
    fn test_not_found_is_distinct() {
        assert!(Error::NotFound("k".into()).is_not_found());
        assert!(!Error::backend("kv get", "timeout").is_not_found());
        assert!(!Error::NotConnected.is_not_found());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::InvalidConfig("x".into()).exit_code(), 1);
        assert_eq!(Error::ConnectionFailed("x".into()).exit_code(), 2);
        assert_eq!(Error::NotFound("x".into()).exit_code(), 3);
        assert_eq!(Error::LockNotAcquired("x".into()).exit_code(), 4);
        assert_eq!(Error::NotConnected.exit_code(), 4);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err: Error = io.into();
        assert!(matches!(err, Error::IoError(ref msg) if msg.contains("missing file")));
    }
}
