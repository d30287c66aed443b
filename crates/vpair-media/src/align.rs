//! Cross-video audio alignment.

use serde::Deserialize;
use std::path::Path;
use std::time::Instant;
use tracing::info;
use vpair_models::Alignment;

use crate::command::{ToolCommand, ToolRunner};
use crate::error::{MediaError, MediaResult};

/// Report written by the alignment tool.
#[derive(Debug, Default, Deserialize)]
struct AlignmentReport {
    target: Option<String>,
    /// Milliseconds
    offset: Option<f64>,
    confidence: Option<f64>,
    elapsed_time_seconds: Option<f64>,
}

/// Run the alignment tool on two files and read its report.
///
/// A report without a target or offset means the inputs already line up.
pub async fn align(tool: &Path, first: &Path, second: &Path, results_path: &Path) -> MediaResult<Alignment> {
    let started = Instant::now();
    let cmd = ToolCommand::new(tool)
        .arg("--files")
        .arg(first.to_string_lossy())
        .arg(second.to_string_lossy())
        .arg("--results-filepath")
        .arg(results_path.to_string_lossy());
    ToolRunner::new().run(&cmd).await?;

    let raw = tokio::fs::read_to_string(results_path)
        .await
        .map_err(|_| MediaError::MissingOutput(results_path.to_path_buf()))?;
    let alignment = parse_report(&raw, first, started.elapsed().as_secs_f64())?;

    info!(
        target_file = %alignment.target,
        offset_ms = alignment.offset,
        confidence = alignment.confidence,
        "Alignment complete"
    );
    Ok(alignment)
}

fn parse_report(raw: &str, first: &Path, measured_secs: f64) -> MediaResult<Alignment> {
    let report: AlignmentReport = if raw.trim().is_empty() {
        AlignmentReport::default()
    } else {
        serde_json::from_str(raw)?
    };

    let elapsed_time_seconds = report.elapsed_time_seconds.unwrap_or(measured_secs);
    let alignment = match (report.target, report.offset) {
        (Some(target), Some(offset)) => Alignment {
            target,
            offset,
            confidence: report.confidence.unwrap_or(0.0),
            elapsed_time_seconds,
        },
        _ => Alignment {
            target: first.to_string_lossy().into_owned(),
            offset: 0.0,
            confidence: report.confidence.unwrap_or(0.0),
            elapsed_time_seconds,
        },
    };
    Ok(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_report() {
        let raw = r#"{"target": "b.mp4", "offset": 1250.0, "confidence": 7.5, "elapsed_time_seconds": 3.2}"#;
        let a = parse_report(raw, Path::new("/in/a.mp4"), 9.0).unwrap();
        assert_eq!(a.target, "b.mp4");
        assert_eq!(a.offset, 1250.0);
        assert_eq!(a.confidence, 7.5);
        assert_eq!(a.elapsed_time_seconds, 3.2);
    }

    #[test]
    fn test_already_aligned_report() {
        let a = parse_report(r#"{"elapsed_time_seconds": 1.0}"#, Path::new("/in/a.mp4"), 9.0).unwrap();
        assert_eq!(a.target, "/in/a.mp4");
        assert_eq!(a.offset, 0.0);
        assert_eq!(a.elapsed_time_seconds, 1.0);

        let a = parse_report("", Path::new("/in/a.mp4"), 9.0).unwrap();
        assert_eq!(a.elapsed_time_seconds, 9.0);
    }

    #[test]
    fn test_malformed_report() {
        assert!(matches!(
            parse_report("{oops", Path::new("/in/a.mp4"), 0.0),
            Err(MediaError::JsonParse(_))
        ));
    }
}
