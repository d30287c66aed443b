//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Video {0} is already being processed")]
    AlreadyProcessing(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] vpair_store::StoreError),

    #[error("Media error: {0}")]
    Media(#[from] vpair_media::MediaError),

    #[error(transparent)]
    Model(#[from] vpair_models::ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn process_not_found(id: impl Into<String>) -> Self {
        Self::ProcessNotFound(id.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the persisted state could not be read or written.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, WorkerError::Store(_))
    }
}
