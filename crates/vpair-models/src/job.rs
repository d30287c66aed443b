//! Supervised process jobs.
//!
//! A `ProcessingJob` lives in the supervisor's registry only while its
//! process is alive; terminal outcomes are written back to the video record.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::video::VideoId;

/// Generated identifier of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    /// Generate a new random process ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Processing,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Processed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Live record of a supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessingJob {
    pub process_id: ProcessId,
    pub video_id: VideoId,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Progress per stage (e.g. audio, thumbnail, video), 0-100
    pub progress: BTreeMap<String, u8>,
    pub error: Option<String>,
    /// Artifact reported on completion
    pub output: Option<PathBuf>,
}

impl ProcessingJob {
    pub fn new(process_id: ProcessId, video_id: VideoId) -> Self {
        Self {
            process_id,
            video_id,
            started_at: Utc::now(),
            status: JobStatus::Processing,
            progress: BTreeMap::new(),
            error: None,
            output: None,
        }
    }

    /// Record stage progress. Terminal jobs ignore further updates.
    pub fn set_progress(&mut self, stage: impl Into<String>, percent: u8) {
        if self.status.is_terminal() {
            return;
        }
        self.progress.insert(stage.into(), percent.min(100));
    }

    /// Mark the job as failed. The first reported error wins.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
    }

    /// Mark the job as completed.
    pub fn complete(&mut self, output: Option<PathBuf>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Processed;
        self.output = output;
    }

    /// Mean progress across reported stages.
    pub fn overall_progress(&self) -> u8 {
        if self.progress.is_empty() {
            return 0;
        }
        let sum: u32 = self.progress.values().map(|&p| p as u32).sum();
        (sum / self.progress.len() as u32) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_progress_and_completion() {
        let mut job = ProcessingJob::new(ProcessId::new(), VideoId::from("a.mp4"));
        job.set_progress("audio", 100);
        job.set_progress("thumbnail", 50);
        job.set_progress("video", 150);
        assert_eq!(job.progress["video"], 100);
        assert_eq!(job.overall_progress(), 83);

        job.complete(Some(PathBuf::from("/out/a.mp4")));
        assert_eq!(job.status, JobStatus::Processed);

        // Terminal state is sticky
        job.fail("late error");
        assert_eq!(job.status, JobStatus::Processed);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_first_error_wins() {
        let mut job = ProcessingJob::new(ProcessId::new(), VideoId::from("a.mp4"));
        job.fail("first");
        job.fail("second");
        assert_eq!(job.error.as_deref(), Some("first"));
        assert!(job.status.is_terminal());
    }
}
