//! Worker and boundary event types.
//!
//! `JobEvent`s flow from job runners to the orchestrator's sink, keyed by
//! item ID. `BoundaryEvent`s are published to whatever presentation layer is
//! listening, always carrying a full snapshot so consumers can re-render
//! rather than diff.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pair::Pair;
use crate::video::{Video, VideoId};

/// A processing stage executed by the job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Media metadata extraction
    Metadata,
    /// Low-fps, low-resolution sample video generation
    SampleVideo,
    /// Cross-video audio alignment (pairs only)
    Alignment,
}

impl ProcessingStage {
    pub const ALL: [ProcessingStage; 3] = [
        ProcessingStage::Metadata,
        ProcessingStage::SampleVideo,
        ProcessingStage::Alignment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Metadata => "metadata",
            ProcessingStage::SampleVideo => "sample_video",
            ProcessingStage::Alignment => "alignment",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProcessingStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "metadata" => Ok(ProcessingStage::Metadata),
            "sample_video" | "sample" => Ok(ProcessingStage::SampleVideo),
            "alignment" | "align" => Ok(ProcessingStage::Alignment),
            other => Err(format!("unknown processing stage: {}", other)),
        }
    }
}

/// Unit of work submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchItem {
    Video(Video),
    Pair(Pair),
}

impl BatchItem {
    /// Item ID (video ID or pair ID).
    pub fn id(&self) -> String {
        match self {
            BatchItem::Video(v) => v.id.to_string(),
            BatchItem::Pair(p) => p.id.to_string(),
        }
    }

    pub fn videos(&self) -> Vec<&Video> {
        match self {
            BatchItem::Video(v) => vec![v],
            BatchItem::Pair(p) => p.members().to_vec(),
        }
    }

    pub fn videos_mut(&mut self) -> Vec<&mut Video> {
        match self {
            BatchItem::Video(v) => vec![v],
            BatchItem::Pair(p) => p.members_mut().into_iter().collect(),
        }
    }

    pub fn video_ids(&self) -> Vec<VideoId> {
        self.videos().into_iter().map(|v| v.id.clone()).collect()
    }
}

/// Lifecycle event emitted by a job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A worker picked up the item
    Init { item: BatchItem },

    /// Intermediate progress of a stage (0-100)
    Progress {
        item_id: String,
        stage: ProcessingStage,
        percent: u8,
        /// Step reported by the tool itself (`audio`, `thumbnail`, `video`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// The item finished successfully
    Update { item: BatchItem },

    /// The item failed; members are reverted to idle
    Error { item: BatchItem, message: String },

    /// The whole batch is done
    Complete { results: Vec<BatchItem> },
}

impl JobEvent {
    /// ID of the item this event concerns (`None` for `Complete`).
    pub fn item_id(&self) -> Option<String> {
        match self {
            JobEvent::Init { item } | JobEvent::Update { item } | JobEvent::Error { item, .. } => {
                Some(item.id())
            }
            JobEvent::Progress { item_id, .. } => Some(item_id.clone()),
            JobEvent::Complete { .. } => None,
        }
    }

    /// Whether no further state change is expected for the item.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Update { .. } | JobEvent::Error { .. } | JobEvent::Complete { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobEvent::Init { .. } => "init",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Update { .. } => "update",
            JobEvent::Error { .. } => "error",
            JobEvent::Complete { .. } => "complete",
        }
    }
}

/// Scope of a batch-level processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// A single media item could not be merged or processed
    Media,
    /// The batch as a whole failed
    Complete,
}

/// Event published to the presentation boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BoundaryEvent {
    /// Persisted state changed
    VideosUpdated {
        pairs: Vec<Pair>,
        #[serde(rename = "unpairedVideos")]
        unpaired_videos: Vec<Video>,
    },

    /// A batch finished
    MediaProcessed { results: Vec<BatchItem> },

    /// A batch-level failure
    ProcessingError {
        #[serde(rename = "type")]
        scope: ErrorScope,
        error: String,
    },
}

impl BoundaryEvent {
    pub fn processing_error(scope: ErrorScope, error: impl Into<String>) -> Self {
        Self::ProcessingError {
            scope,
            error: error.into(),
        }
    }
}
