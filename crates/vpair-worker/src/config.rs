//! Worker configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;
use vpair_media::{SampleVideoSpec, ToolkitConfig};
use vpair_models::{ProcessingStage, DEFAULT_MAX_PAIRING_GAP_SECS};

/// What startup recovery does with videos left in `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Reset to idle, then resubmit through the normal batch path
    #[default]
    Resume,
    /// Reset to idle with an "interrupted" message
    Reset,
}

impl RecoveryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPolicy::Resume => "resume",
            RecoveryPolicy::Reset => "reset",
        }
    }
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "resume" => Ok(RecoveryPolicy::Resume),
            "reset" => Ok(RecoveryPolicy::Reset),
            other => Err(format!("unknown recovery policy: {}", other)),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent batch workers
    pub pool_size: usize,
    /// Directory receiving sample videos and alignment reports
    pub output_dir: PathBuf,
    /// JSON document holding the persisted state
    pub state_file: PathBuf,
    pub sample_video_tool: PathBuf,
    /// Metadata tool; ffprobe is used when unset
    pub metadata_tool: Option<PathBuf>,
    pub alignment_tool: PathBuf,
    pub sample: SampleVideoSpec,
    /// Stages run for every item
    pub stages: Vec<ProcessingStage>,
    pub recovery_policy: RecoveryPolicy,
    /// Maximum creation-time gap for automatic pairing
    pub max_pairing_gap_secs: i64,
    /// Processing cost per second of footage, for time estimates
    pub estimate_seconds_per_media_second: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            output_dir: PathBuf::from("./output"),
            state_file: PathBuf::from("./vpair-state.json"),
            sample_video_tool: PathBuf::from("create_sample_video"),
            metadata_tool: None,
            alignment_tool: PathBuf::from("align_videos"),
            sample: SampleVideoSpec::default(),
            stages: ProcessingStage::ALL.to_vec(),
            recovery_policy: RecoveryPolicy::Resume,
            max_pairing_gap_secs: DEFAULT_MAX_PAIRING_GAP_SECS,
            estimate_seconds_per_media_second: 0.5,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let sample = SampleVideoSpec {
            fps: env_parse("SAMPLE_FPS").unwrap_or(defaults.sample.fps),
            width: env_parse("SAMPLE_WIDTH").unwrap_or(defaults.sample.width),
            codec: std::env::var("SAMPLE_CODEC").unwrap_or(defaults.sample.codec),
            ..SampleVideoSpec::default()
        };
        let sample = match std::env::var("SAMPLE_EXTENSION") {
            Ok(ext) if !ext.trim().is_empty() => sample.with_extension(ext.trim()),
            _ => sample,
        };

        Self {
            pool_size: env_parse::<usize>("WORKER_POOL_SIZE")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.pool_size),
            output_dir: std::env::var("WORKER_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            state_file: std::env::var("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            sample_video_tool: std::env::var("SAMPLE_VIDEO_TOOL")
                .map(PathBuf::from)
                .unwrap_or(defaults.sample_video_tool),
            metadata_tool: std::env::var("METADATA_TOOL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            alignment_tool: std::env::var("ALIGNMENT_TOOL")
                .map(PathBuf::from)
                .unwrap_or(defaults.alignment_tool),
            sample,
            stages: std::env::var("PROCESSING_STAGES")
                .ok()
                .and_then(|s| parse_stages(&s))
                .unwrap_or(defaults.stages),
            recovery_policy: env_parse("RECOVERY_POLICY").unwrap_or(defaults.recovery_policy),
            max_pairing_gap_secs: env_parse("PAIRING_MAX_GAP_SECS").unwrap_or(defaults.max_pairing_gap_secs),
            estimate_seconds_per_media_second: env_parse("ESTIMATE_SECONDS_PER_MEDIA_SECOND")
                .unwrap_or(defaults.estimate_seconds_per_media_second),
        }
    }

    /// Tool settings for the external toolkit.
    pub fn toolkit_config(&self) -> ToolkitConfig {
        ToolkitConfig {
            sample_video_tool: self.sample_video_tool.clone(),
            metadata_tool: self.metadata_tool.clone(),
            alignment_tool: self.alignment_tool.clone(),
            output_dir: self.output_dir.clone(),
            sample: self.sample.clone(),
        }
    }
}

/// Parse a comma-separated stage list. Unknown names are skipped.
///
/// Returns `None` when nothing valid remains, so the default applies.
pub fn parse_stages(s: &str) -> Option<Vec<ProcessingStage>> {
    let mut stages = Vec::new();
    for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match name.parse::<ProcessingStage>() {
            Ok(stage) if !stages.contains(&stage) => stages.push(stage),
            Ok(_) => {}
            Err(e) => warn!("Ignoring PROCESSING_STAGES entry: {}", e),
        }
    }
    if stages.is_empty() {
        return None;
    }
    stages.sort();
    Some(stages)
}

fn default_pool_size() -> usize {
    num_cpus::get_physical().max(1)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.pool_size >= 1);
        assert_eq!(config.stages, ProcessingStage::ALL.to_vec());
        assert_eq!(config.recovery_policy, RecoveryPolicy::Resume);
        assert_eq!(config.max_pairing_gap_secs, 30);
        assert!(config.metadata_tool.is_none());
        assert_eq!(config.sample.fps, 1);
        assert_eq!(config.sample.width, 320);
    }

    #[test]
    fn test_parse_stages() {
        assert_eq!(
            parse_stages("alignment, sample-video,bogus,alignment"),
            Some(vec![ProcessingStage::SampleVideo, ProcessingStage::Alignment])
        );
        assert_eq!(parse_stages(" , bogus"), None);
    }

    #[test]
    fn test_recovery_policy_parsing() {
        assert_eq!("RESET".parse::<RecoveryPolicy>().unwrap(), RecoveryPolicy::Reset);
        assert_eq!(" resume ".parse::<RecoveryPolicy>().unwrap(), RecoveryPolicy::Resume);
        assert!("retry".parse::<RecoveryPolicy>().is_err());
    }

    #[test]
    fn test_toolkit_config_mirrors_settings() {
        let config = WorkerConfig {
            metadata_tool: Some(PathBuf::from("/opt/tools/meta")),
            ..WorkerConfig::default()
        };
        let toolkit = config.toolkit_config();
        assert_eq!(toolkit.metadata_tool, config.metadata_tool);
        assert_eq!(toolkit.output_dir, config.output_dir);
    }
}
