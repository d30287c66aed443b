//! Error types for media tool invocations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while running external media tools.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Displays only the tool's own diagnostics so they can be surfaced verbatim.
    #[error("{message}")]
    ToolFailed {
        tool: String,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Metadata extraction failed: {0}")]
    MetadataFailed(String),

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Tool reported success but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create a tool failure error.
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
            exit_code,
        }
    }

    /// Create a metadata failure error.
    pub fn metadata_failed(message: impl Into<String>) -> Self {
        Self::MetadataFailed(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
