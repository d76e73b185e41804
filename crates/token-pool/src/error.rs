//! Error types for pool operations

use relay_store::AccountStatus;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("cannot {action} account in {} state", .from.label())]
    InvalidTransition {
        action: &'static str,
        from: AccountStatus,
    },

    #[error("datastore error: {0}")]
    Store(String),
}

impl From<relay_store::Error> for Error {
    fn from(err: relay_store::Error) -> Self {
        match err {
            relay_store::Error::NotFound(msg) => Error::NotFound(msg),
            other => Error::Store(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
