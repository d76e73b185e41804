//! Error types for datastore operations

/// Errors from datastore operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("limit reached: {0}")]
    LimitReached(String),
}

/// Result alias for datastore operations.
pub type Result<T> = std::result::Result<T, Error>;
