//! Video records and their processing lifecycle.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ModelError, ModelResult};

/// Stable identifier of a video, derived from its file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    /// Derive the ID from a file path (its file name).
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self(name)
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Video processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    /// Not processing; ready to be submitted
    #[default]
    Idle,
    /// Queued in a batch or running in a worker
    Processing,
    /// Processing finished and the preview artifact exists
    Processed,
    /// Metadata could not be extracted at import time
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Idle => "idle",
            VideoStatus::Processing => "processing",
            VideoStatus::Processed => "processed",
            VideoStatus::Error => "error",
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Media metadata reported by the metadata-extraction tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MediaMetadata {
    /// Frames per second
    pub fps: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Total number of frames
    pub frame_count: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Content checksum
    pub checksum: String,
}

/// A raw video file tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    /// Stable ID (file name)
    pub id: VideoId,

    /// Source file path
    pub path: PathBuf,

    /// Display name
    pub name: String,

    /// File creation timestamp, used for pairing
    pub created_at: DateTime<Utc>,

    /// Size in bytes
    #[serde(default)]
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,

    #[serde(default)]
    pub status: VideoStatus,

    /// Set when a worker actually starts the job (absent while queued)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_processing_time: Option<DateTime<Utc>>,

    /// Processing duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Output artifact (sample video)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<PathBuf>,
}

impl Video {
    /// Create an idle video record for a file.
    pub fn new(path: impl Into<PathBuf>, created_at: DateTime<Utc>, size: u64) -> Self {
        let path = path.into();
        let id = VideoId::from_path(&path);
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());

        Self {
            id,
            path,
            name,
            created_at,
            size,
            metadata: None,
            status: VideoStatus::Idle,
            start_processing_time: None,
            processing_time: None,
            error: None,
            preview: None,
        }
    }

    /// Attach media metadata.
    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether the video is queued in a batch but not yet picked up by a worker.
    pub fn is_queued(&self) -> bool {
        self.status == VideoStatus::Processing && self.start_processing_time.is_none()
    }

    /// Whether a worker is actively running this video.
    pub fn is_running(&self) -> bool {
        self.status == VideoStatus::Processing && self.start_processing_time.is_some()
    }

    /// Queue the video for processing (optimistic, before a worker starts).
    pub fn queue(&mut self) -> ModelResult<()> {
        if self.status == VideoStatus::Processing {
            return Err(ModelError::invalid_transition(
                self.id.as_str(),
                self.status,
                VideoStatus::Processing,
            ));
        }
        self.status = VideoStatus::Processing;
        self.start_processing_time = None;
        self.error = None;
        Ok(())
    }

    /// Record that a worker started the job.
    pub fn begin(&mut self, at: DateTime<Utc>) -> ModelResult<()> {
        self.expect_processing(VideoStatus::Processing)?;
        self.start_processing_time = Some(at);
        Ok(())
    }

    /// Mark the job as done. The preview artifact is mandatory.
    pub fn complete(&mut self, preview: impl Into<PathBuf>, processing_time_ms: u64) -> ModelResult<()> {
        self.expect_processing(VideoStatus::Processed)?;
        let preview = preview.into();
        if preview.as_os_str().is_empty() {
            return Err(ModelError::MissingArtifact(self.id.to_string()));
        }
        self.status = VideoStatus::Processed;
        self.preview = Some(preview);
        self.processing_time = Some(processing_time_ms);
        self.error = None;
        Ok(())
    }

    /// Revert a failed job to idle, keeping the error message.
    pub fn fail(&mut self, message: impl Into<String>) -> ModelResult<()> {
        self.expect_processing(VideoStatus::Idle)?;
        self.status = VideoStatus::Idle;
        self.start_processing_time = None;
        self.error = Some(message.into());
        Ok(())
    }

    /// Force the video back to idle (kill, recovery).
    pub fn reset(&mut self, reason: Option<String>) {
        self.status = VideoStatus::Idle;
        self.start_processing_time = None;
        if reason.is_some() {
            self.error = reason;
        }
    }

    /// Flag a video whose metadata could not be extracted.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = VideoStatus::Error;
        self.start_processing_time = None;
        self.error = Some(message.into());
    }

    /// Heuristic processing-time estimate for display purposes.
    ///
    /// `seconds_per_media_second` is the observed cost of one second of footage.
    pub fn estimated_processing_time(&self, seconds_per_media_second: f64) -> Option<Duration> {
        let duration = self.metadata.as_ref()?.duration;
        if duration <= 0.0 || seconds_per_media_second <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(duration * seconds_per_media_second))
    }

    fn expect_processing(&self, to: VideoStatus) -> ModelResult<()> {
        if self.status != VideoStatus::Processing {
            return Err(ModelError::invalid_transition(self.id.as_str(), self.status, to));
        }
        Ok(())
    }
}
