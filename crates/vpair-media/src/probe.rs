//! Media metadata extraction.
//!
//! A dedicated metadata tool is preferred (`<tool> -i <input>` printing one
//! JSON object). Without one, metadata comes from ffprobe.

use serde::Deserialize;
use md5::{Digest, Md5};
use std::path::Path;
use tracing::debug;
use vpair_models::MediaMetadata;

use crate::command::{failure, ToolCommand, ToolRunner};
use crate::error::{MediaError, MediaResult};

/// Report printed by the metadata tool: either the metadata or `{"error": …}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MetadataReport {
    Ok(MediaMetadata),
    Err { error: String },
}

/// Extract metadata with the given tool, or ffprobe when `tool` is `None`.
pub async fn extract_metadata(tool: Option<&Path>, input: impl AsRef<Path>) -> MediaResult<MediaMetadata> {
    let input = input.as_ref();
    if !input.exists() {
        return Err(MediaError::FileNotFound(input.to_path_buf()));
    }
    match tool {
        Some(tool) => run_metadata_tool(tool, input).await,
        None => probe_metadata(input).await,
    }
}

async fn run_metadata_tool(tool: &Path, input: &Path) -> MediaResult<MediaMetadata> {
    let cmd = ToolCommand::new(tool).input(input);
    let output = ToolRunner::new().output(&cmd).await?;

    // The report is the last non-empty stdout line; anything before it is chatter
    let report = output
        .stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<MetadataReport>(l.trim()).ok());

    match report {
        Some(MetadataReport::Ok(metadata)) if output.success() => Ok(metadata),
        Some(MetadataReport::Err { error }) => Err(MediaError::metadata_failed(error)),
        _ if !output.success() => Err(failure(&cmd, &output.stderr, output.exit_code)),
        _ => Err(MediaError::metadata_failed(format!(
            "{} printed no metadata for {}",
            cmd.tool_name(),
            input.display()
        ))),
    }
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

/// Probe a file with ffprobe.
pub async fn probe_metadata(input: &Path) -> MediaResult<MediaMetadata> {
    let cmd = ToolCommand::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(input.to_string_lossy());
    let output = ToolRunner::new().output(&cmd).await?;
    if !output.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("FFprobe failed for {}", input.display()),
            stderr: Some(output.stderr),
        });
    }
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_ffprobe(&name, &output.stdout)
}

fn parse_ffprobe(name: &str, json: &str) -> MediaResult<MediaMetadata> {
    let probe: FfprobeOutput = serde_json::from_str(json)?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| MediaError::InvalidVideo(format!("No video stream found in {}", name)))?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let duration = probe
        .format
        .duration
        .as_deref()
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or_else(|| (duration * fps).round() as u64);

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    debug!(file = name, fps, duration, frame_count, "Probed video");

    Ok(MediaMetadata {
        fps,
        duration,
        frame_count,
        width,
        height,
        checksum: checksum(name, width, height, fps, frame_count),
    })
}

/// Content checksum over the file name and the stream shape.
///
/// MD5 of `name:width:height:fps:frames`, the same value the metadata tool
/// reports. Whole frame rates keep their `.0` (`30.0`, not `30`).
pub fn checksum(name: &str, width: u32, height: u32, fps: f64, frame_count: u64) -> String {
    let fps = if fps.is_finite() && fps.fract() == 0.0 {
        format!("{:.1}", fps)
    } else {
        fps.to_string()
    };
    let digest = Md5::digest(format!("{}:{}:{}:{}:{}", name, width, height, fps, frame_count));
    format!("{:x}", digest)
}

/// Parse frame rate string (e.g., "30/1" or "29.97").
fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}
