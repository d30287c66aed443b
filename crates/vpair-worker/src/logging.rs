//! Structured job logging utilities.
//!
//! Every batch item and supervised process logs through a [`JobLogger`], so
//! log lines and spans carry the same `item_id`/`kind` fields and a
//! supervised process also carries the video it runs for.

use tracing::{error, info, warn, Span};
use vpair_models::{BatchItem, ProcessId, VideoId};

/// What a logged job works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// A lone video in a batch
    Video,
    /// Both members of a pair in a batch
    Pair,
    /// A raw process started through the supervisor
    SupervisedProcess,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Video => "video",
            JobKind::Pair => "pair",
            JobKind::SupervisedProcess => "supervised_process",
        }
    }
}

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    item_id: String,
    kind: JobKind,
    /// Video a supervised process runs for
    video_id: Option<VideoId>,
}

impl JobLogger {
    /// Logger for a batch item, keyed by the video or pair ID.
    pub fn for_item(item: &BatchItem) -> Self {
        let kind = match item {
            BatchItem::Video(_) => JobKind::Video,
            BatchItem::Pair(_) => JobKind::Pair,
        };
        Self {
            item_id: item.id(),
            kind,
            video_id: None,
        }
    }

    /// Logger for a supervised process running for `video_id`.
    pub fn for_process(process_id: &ProcessId, video_id: &VideoId) -> Self {
        Self {
            item_id: process_id.to_string(),
            kind: JobKind::SupervisedProcess,
            video_id: Some(video_id.clone()),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Log the start of a job.
    pub fn log_start(&self, message: &str) {
        info!(
            item_id = %self.item_id,
            kind = self.kind.as_str(),
            video_id = ?self.video_id,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            item_id = %self.item_id,
            kind = self.kind.as_str(),
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            item_id = %self.item_id,
            kind = self.kind.as_str(),
            video_id = ?self.video_id,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            item_id = %self.item_id,
            kind = self.kind.as_str(),
            video_id = ?self.video_id,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job.
    pub fn log_completion(&self, message: &str) {
        info!(
            item_id = %self.item_id,
            kind = self.kind.as_str(),
            "Job completed: {}", message
        );
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            item_id = %self.item_id,
            kind = self.kind.as_str(),
            video_id = ?self.video_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vpair_models::{Pair, Video};

    #[test]
    fn test_kind_follows_item() {
        let a = Video::new("/in/a.mp4", Utc::now(), 1);
        let b = Video::new("/in/b.mp4", Utc::now(), 2);

        assert_eq!(JobLogger::for_item(&BatchItem::Video(a.clone())).kind(), JobKind::Video);
        let pair = JobLogger::for_item(&BatchItem::Pair(Pair::new(a, b)));
        assert_eq!(pair.kind(), JobKind::Pair);
        assert_eq!(pair.item_id, "a.mp4__b.mp4");

        let process = JobLogger::for_process(&ProcessId::new(), &VideoId::from("a.mp4"));
        assert_eq!(process.kind().as_str(), "supervised_process");
        assert_eq!(process.video_id, Some(VideoId::from("a.mp4")));
    }
}
