//! Model error types.

use thiserror::Error;

use crate::video::VideoStatus;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by lifecycle transitions and pairing bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Video {video_id} cannot move from {from} to {to}")]
    InvalidTransition {
        video_id: String,
        from: VideoStatus,
        to: VideoStatus,
    },

    #[error("Video {0} has no output artifact")]
    MissingArtifact(String),

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Pair not found: {0}")]
    PairNotFound(String),

    #[error("Video {0} is already paired")]
    AlreadyPaired(String),

    #[error("Cannot pair video {0} with itself")]
    SelfPair(String),

    #[error("Video {0} appears more than once in the processing state")]
    DuplicateVideo(String),
}

impl ModelError {
    pub fn invalid_transition(video_id: impl Into<String>, from: VideoStatus, to: VideoStatus) -> Self {
        Self::InvalidTransition {
            video_id: video_id.into(),
            from,
            to,
        }
    }

    pub fn video_not_found(video_id: impl Into<String>) -> Self {
        Self::VideoNotFound(video_id.into())
    }

    pub fn pair_not_found(pair_id: impl Into<String>) -> Self {
        Self::PairNotFound(pair_id.into())
    }
}
