//! Runs the processing stages for one batch item.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use vpair_media::{MediaToolkit, ProgressFn};
use vpair_models::{BatchItem, JobEvent, ModelError, ProcessingStage, VideoId};

use crate::events::EventEmitter;
use crate::logging::JobLogger;

/// Executes the configured stages for an item and reports through events.
///
/// Every call emits `init`, any number of `progress`, then exactly one of
/// `update` or `error`.
pub struct JobRunner {
    toolkit: Arc<dyn MediaToolkit>,
    stages: Vec<ProcessingStage>,
    estimate_factor: f64,
}

impl JobRunner {
    pub fn new(toolkit: Arc<dyn MediaToolkit>, stages: Vec<ProcessingStage>) -> Self {
        Self {
            toolkit,
            stages,
            estimate_factor: 0.0,
        }
    }

    /// Log a time estimate at start, using this many seconds per second of footage.
    pub fn with_estimate_factor(mut self, factor: f64) -> Self {
        self.estimate_factor = factor;
        self
    }

    pub fn stages(&self) -> &[ProcessingStage] {
        &self.stages
    }

    fn runs(&self, stage: ProcessingStage) -> bool {
        self.stages.contains(&stage)
    }

    /// Process one item. Tool failures end up in an `error` event, never in a panic.
    pub async fn run(&self, mut item: BatchItem, events: &EventEmitter) {
        let item_id = item.id();
        let logger = JobLogger::for_item(&item);
        let span = logger.create_span();

        async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            let started = start_members(&mut item, started_at);
            events.emit(JobEvent::Init { item: item.clone() });
            self.log_estimate(&item, &logger);

            let result = match started {
                Ok(()) => self.run_stages(&mut item, &item_id, events, &logger).await,
                Err(message) => Err(message),
            };
            let elapsed = clock.elapsed();
            let elapsed_ms = elapsed.as_millis() as u64;

            match result.and_then(|previews| finish(&mut item, &previews, elapsed_ms)) {
                Ok(()) => {
                    logger.log_completion(&format!("processed in {} ms", elapsed_ms));
                    metrics::counter!("vpair_items_processed_total", "kind" => logger.kind().as_str()).increment(1);
                    metrics::histogram!("vpair_item_processing_seconds").record(elapsed.as_secs_f64());
                    events.emit(JobEvent::Update { item });
                }
                Err(message) => {
                    logger.log_error(&message);
                    metrics::counter!("vpair_items_failed_total", "kind" => logger.kind().as_str()).increment(1);
                    revert(&mut item, &message);
                    events.emit(JobEvent::Error { item, message });
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        item: &mut BatchItem,
        item_id: &str,
        events: &EventEmitter,
        logger: &JobLogger,
    ) -> Result<HashMap<VideoId, PathBuf>, String> {
        let mut previews = HashMap::new();

        if self.runs(ProcessingStage::Metadata) {
            for video in item.videos_mut() {
                if video.metadata.is_some() {
                    continue;
                }
                let metadata = self
                    .toolkit
                    .extract_metadata(&video.path)
                    .await
                    .map_err(|e| e.to_string())?;
                video.metadata = Some(metadata);
            }
            emit_progress(events, item_id, ProcessingStage::Metadata, 100, None);
        }

        if self.runs(ProcessingStage::SampleVideo) {
            for video in item.videos() {
                let progress = progress_fn(events.clone(), item_id.to_string());
                let preview = self
                    .toolkit
                    .create_sample_video(&video.path, progress)
                    .await
                    .map_err(|e| e.to_string())?;
                logger.log_progress(&format!("sample video for {} at {}", video.id, preview.display()));
                previews.insert(video.id.clone(), preview);
            }
            emit_progress(events, item_id, ProcessingStage::SampleVideo, 100, None);
        }

        if self.runs(ProcessingStage::Alignment) {
            if let BatchItem::Pair(pair) = item {
                let input = |video: &vpair_models::Video| {
                    previews
                        .get(&video.id)
                        .cloned()
                        .or_else(|| video.preview.clone())
                        .unwrap_or_else(|| video.path.clone())
                };
                let (first, second) = (input(&pair.video1), input(&pair.video2));
                let alignment = self
                    .toolkit
                    .align(&first, &second)
                    .await
                    .map_err(|e| e.to_string())?;
                pair.alignment = Some(alignment);
                emit_progress(events, item_id, ProcessingStage::Alignment, 100, None);
            }
        }

        Ok(previews)
    }

    fn log_estimate(&self, item: &BatchItem, logger: &JobLogger) {
        if self.estimate_factor <= 0.0 {
            return;
        }
        let total: f64 = item
            .videos()
            .iter()
            .filter_map(|v| v.estimated_processing_time(self.estimate_factor))
            .map(|d| d.as_secs_f64())
            .sum();
        if total > 0.0 {
            logger.log_progress(&format!("estimated processing time {:.0}s", total));
        }
    }
}

fn emit_progress(events: &EventEmitter, item_id: &str, stage: ProcessingStage, percent: u8, detail: Option<&str>) {
    events.emit(JobEvent::Progress {
        item_id: item_id.to_string(),
        stage,
        percent,
        detail: detail.map(str::to_string),
    });
}

fn progress_fn(events: EventEmitter, item_id: String) -> ProgressFn {
    Arc::new(move |tool_stage: &str, percent: u8| {
        tracing::debug!(item_id = %item_id, tool_stage, percent, "Tool progress");
        emit_progress(&events, &item_id, ProcessingStage::SampleVideo, percent, Some(tool_stage));
    })
}

/// Move every member to running. Members submitted without going through
/// the queueing step are queued first.
fn start_members(item: &mut BatchItem, at: DateTime<Utc>) -> Result<(), String> {
    for video in item.videos_mut() {
        if !video.is_queued() && !video.is_running() {
            video.queue().map_err(|e| e.to_string())?;
        }
        video.begin(at).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Mark every member processed. A member without a preview fails the item.
fn finish(item: &mut BatchItem, previews: &HashMap<VideoId, PathBuf>, elapsed_ms: u64) -> Result<(), String> {
    for video in item.videos() {
        if !previews.contains_key(&video.id) && video.preview.is_none() {
            return Err(ModelError::MissingArtifact(video.id.to_string()).to_string());
        }
    }
    for video in item.videos_mut() {
        let preview = match previews.get(&video.id) {
            Some(preview) => preview.clone(),
            None => video.preview.clone().unwrap_or_default(),
        };
        video.complete(preview, elapsed_ms).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Revert members to idle with the failure message.
pub(crate) fn revert(item: &mut BatchItem, message: &str) {
    for video in item.videos_mut() {
        if video.fail(message).is_err() {
            video.reset(Some(message.to_string()));
        }
    }
}
