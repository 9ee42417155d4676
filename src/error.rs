//! Error types for sqt.

use thiserror::Error;

/// The main error type for driver operations.
#[derive(Debug, Error)]
pub enum SqtError {
    /// Handshake failure, broken socket or a missing connection.
    #[error("{0}")]
    Connection(String),

    /// The server rejected a command (ErrorResponse).
    #[error("{message}")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    /// Malformed or unexpected protocol traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication exchange failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A data batch does not match the columns the result table was created with.
    #[error("source and destination resultsets do not match ({expected} columns expected, {found} received)")]
    ColumnMismatch { expected: usize, found: usize },

    /// Another command is already in progress on the connection.
    #[error("another command is already in progress")]
    Busy,

    /// Invalid connection string or configuration file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SqtError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True for failures that leave the socket unusable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_) | Self::Protocol(_))
    }
}

/// Result type alias for driver operations.
pub type SqtResult<T> = Result<T, SqtError>;
