//! The set of media operations a job needs, behind one trait.

use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use vpair_models::{Alignment, MediaMetadata};

use crate::align;
use crate::command::ToolRunner;
use crate::error::{MediaError, MediaResult};
use crate::probe;
use crate::progress::ToolMessage;
use crate::sample::{self, SampleVideoSpec};

/// Stage progress callback: `(stage, percent)`.
pub type ProgressFn = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Media operations used by the job runner.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Read fps, duration, frame count, resolution and checksum.
    async fn extract_metadata(&self, input: &Path) -> MediaResult<MediaMetadata>;

    /// Generate the sample video and return its path.
    async fn create_sample_video(&self, input: &Path, progress: ProgressFn) -> MediaResult<PathBuf>;

    /// Compute the audio offset between two files.
    async fn align(&self, first: &Path, second: &Path) -> MediaResult<Alignment>;
}

/// Executables and output settings for [`ExternalToolkit`].
#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    pub sample_video_tool: PathBuf,
    /// `None` falls back to ffprobe
    pub metadata_tool: Option<PathBuf>,
    pub alignment_tool: PathBuf,
    pub output_dir: PathBuf,
    pub sample: SampleVideoSpec,
}

/// Toolkit backed by external executables.
#[derive(Debug, Clone)]
pub struct ExternalToolkit {
    config: ToolkitConfig,
    runner: ToolRunner,
}

impl ExternalToolkit {
    pub fn new(config: ToolkitConfig) -> Self {
        Self {
            config,
            runner: ToolRunner::new(),
        }
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }
}

#[async_trait]
impl MediaToolkit for ExternalToolkit {
    async fn extract_metadata(&self, input: &Path) -> MediaResult<MediaMetadata> {
        probe::extract_metadata(self.config.metadata_tool.as_deref(), input).await
    }

    async fn create_sample_video(&self, input: &Path, progress: ProgressFn) -> MediaResult<PathBuf> {
        if !input.exists() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let spec = &self.config.sample;
        let filename = spec.filename_for(input, Local::now());
        let cmd = spec.command(&self.config.sample_video_tool, input, &self.config.output_dir, &filename);

        let reported_output: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let reported_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (output_slot, error_slot) = (reported_output.clone(), reported_error.clone());

        self.runner
            .run_with_messages(&cmd, move |tagged| match tagged.message {
                ToolMessage::Progress { stage, percent } => progress(&stage, percent),
                ToolMessage::Error { message } => {
                    if let Ok(mut slot) = error_slot.lock() {
                        slot.get_or_insert(message);
                    }
                }
                ToolMessage::Complete { output } => {
                    if let Ok(mut slot) = output_slot.lock() {
                        *slot = output;
                    }
                }
            })
            .await?;

        if let Some(message) = reported_error.lock().ok().and_then(|mut e| e.take()) {
            return Err(MediaError::tool_failed(cmd.tool_name(), message, Some(0)));
        }

        let output = reported_output
            .lock()
            .ok()
            .and_then(|mut o| o.take())
            .map(PathBuf::from)
            .unwrap_or_else(|| sample::output_path(&self.config.output_dir, &filename));

        if !output.exists() {
            warn!(output = %output.display(), "Sample tool exited cleanly without producing output");
            return Err(MediaError::MissingOutput(output));
        }
        debug!(output = %output.display(), "Sample video created");
        Ok(output)
    }

    async fn align(&self, first: &Path, second: &Path) -> MediaResult<Alignment> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let results_path = self.config.output_dir.join(format!(
            "{}__{}.alignment.json",
            file_name(first),
            file_name(second)
        ));
        align::align(&self.config.alignment_tool, first, second, &results_path).await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
