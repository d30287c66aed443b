//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Read failed for key {key}: {message}")]
    ReadFailed { key: String, message: String },

    #[error("Write failed for key {key}: {message}")]
    WriteFailed { key: String, message: String },

    #[error("Corrupt value for key {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn read_failed(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ReadFailed {
            key: key.into(),
            message: msg.into(),
        }
    }

    pub fn write_failed(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::WriteFailed {
            key: key.into(),
            message: msg.into(),
        }
    }

    pub fn corrupt(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: msg.into(),
        }
    }
}
