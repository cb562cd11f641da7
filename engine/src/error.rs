//! Error types for the sync engine.

use crate::{CollectionName, RecordId};
use thiserror::Error;

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Local datastore errors
    #[error("storage failure: {0}")]
    Storage(String),

    // Origin errors
    #[error("network failure: {0}")]
    Network(String),

    #[error("origin rejected request ({status}): {message}")]
    OriginRejected { status: u16, message: String },

    #[error("malformed origin response: {0}")]
    MalformedResponse(String),

    // Validation errors
    #[error("unknown collection: {0}")]
    UnknownCollection(CollectionName),

    #[error("record not found: {collection}/{id}")]
    RecordNotFound {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("{0} can only be created while online")]
    OnlineOnly(CollectionName),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether a background worker should simply try again on its next cycle.
    ///
    /// Network failures, timeouts and origin-side 5xx/429 answers are transient.
    /// Everything else would fail the same way with the same input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::OriginRejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether this failure came from talking to the origin.
    pub fn is_origin_failure(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::OriginRejected { .. } | Error::MalformedResponse(_)
        )
    }

    pub(crate) fn timeout(what: &str) -> Self {
        Error::Network(format!("{what} timed out"))
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(format!("migration failed: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
