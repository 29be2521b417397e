//! Error types for the relay.

use thiserror::Error;

/// Main error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    #[error("Unknown filter field: {0}")]
    UnknownField(String),

    #[error("Regex clauses are not supported")]
    RegexUnsupported,

    #[error("Invalid clause value for field {field}: {reason}")]
    InvalidClause { field: String, reason: String },

    #[error("Invalid mark status: {0} (expected \"read\" or \"unread\")")]
    InvalidStatus(String),
}

impl RelayError {
    /// True for errors caused by bad caller input, so a transport can map
    /// them to protocol-level fault codes instead of internal failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::FilterNotFound(_)
                | RelayError::UnknownField(_)
                | RelayError::RegexUnsupported
                | RelayError::InvalidClause { .. }
                | RelayError::InvalidStatus(_)
        )
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
