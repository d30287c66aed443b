//! Sample (preview) video generation.
//!
//! The sample tool downsamples a source video to a low frame rate and width
//! and writes it into an output directory under a derived name.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use crate::command::ToolCommand;

pub const DEFAULT_SAMPLE_FPS: u32 = 1;
pub const DEFAULT_SAMPLE_WIDTH: u32 = 320;
pub const DEFAULT_SAMPLE_EXTENSION: &str = ".mp4";
pub const DEFAULT_SAMPLE_CODEC: &str = "libx264";

/// Parameters for sample video generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleVideoSpec {
    pub fps: u32,
    pub width: u32,
    pub codec: String,
    /// Output extension including the dot
    pub extension: String,
}

impl Default for SampleVideoSpec {
    fn default() -> Self {
        Self {
            fps: DEFAULT_SAMPLE_FPS,
            width: DEFAULT_SAMPLE_WIDTH,
            codec: DEFAULT_SAMPLE_CODEC.to_string(),
            extension: DEFAULT_SAMPLE_EXTENSION.to_string(),
        }
    }
}

impl SampleVideoSpec {
    /// Normalize the extension so it always carries a leading dot.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        let ext = extension.into();
        self.extension = if ext.starts_with('.') { ext } else { format!(".{}", ext) };
        self
    }

    /// Output file name for `input` generated at `now`.
    ///
    /// `<YYYYMMDD>-<fps>fps-<width>w-<stem><ext>`, with a percent-encoded stem decoded.
    pub fn filename_for(&self, input: &Path, now: DateTime<Local>) -> String {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = urlencoding::decode(&stem)
            .map(|s| s.into_owned())
            .unwrap_or(stem);
        format!(
            "{}-{}fps-{}w-{}{}",
            now.format("%Y%m%d"),
            self.fps,
            self.width,
            stem,
            self.extension
        )
    }

    /// Build the tool invocation writing `filename` into `output_dir`.
    pub fn command(&self, tool: &Path, input: &Path, output_dir: &Path, filename: &str) -> ToolCommand {
        ToolCommand::new(tool)
            .input(input)
            .output_dir(output_dir)
            .fps(self.fps)
            .width(self.width)
            .codec(self.codec.clone())
            .extension(self.extension.clone())
            .output_filename(filename)
    }
}

/// Where the sample tool writes its output.
pub fn output_path(output_dir: &Path, filename: &str) -> PathBuf {
    output_dir.join(filename)
}
