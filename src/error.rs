use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend failure (schema, constraint, I/O). Fatal to the current
    /// operation; rolls back the enclosing transaction.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    /// Remote call failure. Recorded on observable state; the scheduler
    /// keeps running and retries on the next cycle.
    #[error("api: {0}")]
    Api(#[from] ApiError),
    /// Schema violation or protocol misuse. Fatal, not retried.
    #[error("logic: {0}")]
    Logic(String),
}

impl Error {
    pub fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }

    /// Classify for the observable `api_error` slot.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Error::Api(e) => e.clone(),
            other => ApiError::other(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("database closed")]
    Closed,
    #[error("transaction aborted")]
    TxAborted,
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Sqlite(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(StorageError::Serde(e))
    }
}

/// Whether a remote failure looked like a connectivity problem or a
/// server-side application error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiErrorKind {
    Network,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn network(msg: impl Into<String>) -> Self {
        ApiError { kind: ApiErrorKind::Network, message: msg.into() }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        ApiError { kind: ApiErrorKind::Other, message: msg.into() }
    }

    pub fn is_network(&self) -> bool {
        self.kind == ApiErrorKind::Network
    }
}
