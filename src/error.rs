use thiserror::Error;

/// Error kinds surfaced by the storage core.
///
/// Recoverable failures are returned to the direct caller; structural
/// inconsistencies in critical data structures do not come through here,
/// they abort the process after logging.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted page: {0}")]
    Corrupted(String),

    #[error("lock violation: {0}")]
    Lock(String),

    #[error("transaction aborted")]
    Aborted,

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("operation canceled")]
    Canceled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}
