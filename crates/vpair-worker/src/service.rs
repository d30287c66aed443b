//! Caller-facing façade over the engine.
//!
//! Wires the ledger, orchestrator, supervisor and matcher together and
//! exposes the operations a presentation layer needs: import, manual
//! pairing, processing and recovery.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use vpair_media::{ExternalToolkit, MediaToolkit};
use vpair_models::{
    BoundaryEvent, ErrorScope, ModelError, PairId, ProcessingState, Video, VideoId, VideoMatcher,
};
use vpair_store::{JsonFileStore, KvStateRepository, StateRepository};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::events::EventHub;
use crate::ledger::{LedgerSink, StateLedger};
use crate::orchestrator::{BatchOrchestrator, BatchReport};
use crate::recovery::{recover_orphans, RecoveryReport};
use crate::runner::JobRunner;
use crate::supervisor::ProcessSupervisor;

/// Outcome of an import.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Newly tracked videos
    pub added: Vec<VideoId>,
    /// Paths whose file name is already tracked
    pub duplicates: Vec<VideoId>,
    /// Paths that could not be read
    pub failed: Vec<(PathBuf, String)>,
}

/// Outcome of a processing request.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub batch: BatchReport,
    /// Requested videos skipped because a job is already in flight
    pub already_processing: Vec<VideoId>,
    /// Requested IDs that are not tracked
    pub unknown: Vec<VideoId>,
}

/// Pairing and processing engine.
pub struct MediaService {
    config: WorkerConfig,
    ledger: Arc<StateLedger>,
    toolkit: Arc<dyn MediaToolkit>,
    orchestrator: BatchOrchestrator,
    supervisor: ProcessSupervisor,
    matcher: VideoMatcher,
}

impl MediaService {
    pub fn new(
        config: WorkerConfig,
        repository: Arc<dyn StateRepository>,
        toolkit: Arc<dyn MediaToolkit>,
        hub: Arc<EventHub>,
    ) -> Self {
        let ledger = Arc::new(StateLedger::new(repository, hub));
        let runner = JobRunner::new(Arc::clone(&toolkit), config.stages.clone())
            .with_estimate_factor(config.estimate_seconds_per_media_second);
        let orchestrator = BatchOrchestrator::new(Arc::new(runner), config.pool_size);
        let supervisor = ProcessSupervisor::new(Arc::clone(&ledger));
        let matcher = VideoMatcher::new(config.max_pairing_gap_secs);

        Self {
            config,
            ledger,
            toolkit,
            orchestrator,
            supervisor,
            matcher,
        }
    }

    /// Build a service backed by the JSON state file and the external tools.
    pub fn from_config(config: WorkerConfig) -> Self {
        let store = Arc::new(JsonFileStore::new(&config.state_file));
        let repository = Arc::new(KvStateRepository::new(store));
        let toolkit = Arc::new(ExternalToolkit::new(config.toolkit_config()));
        Self::new(config, repository, toolkit, Arc::new(EventHub::new()))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoundaryEvent> {
        self.ledger.hub().subscribe()
    }

    pub async fn state(&self) -> WorkerResult<ProcessingState> {
        self.ledger.snapshot().await
    }

    /// Track new video files and pair them with the current unpaired set.
    ///
    /// Videos whose metadata cannot be extracted are still tracked, in the
    /// `error` state.
    pub async fn import_videos(&self, paths: &[PathBuf]) -> WorkerResult<ImportReport> {
        let mut report = ImportReport::default();
        let mut videos = Vec::with_capacity(paths.len());

        for path in paths {
            let meta = match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => {
                    report.failed.push((path.clone(), "not a file".to_string()));
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), "Cannot read video file: {}", e);
                    report.failed.push((path.clone(), e.to_string()));
                    continue;
                }
            };
            let created_at: DateTime<Utc> = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let mut video = Video::new(path.clone(), created_at, meta.len());
            match self.toolkit.extract_metadata(path).await {
                Ok(metadata) => video.metadata = Some(metadata),
                Err(e) => {
                    warn!(video_id = %video.id, "Metadata extraction failed: {}", e);
                    video.mark_error(e.to_string());
                }
            }
            videos.push(video);
        }

        let matcher = &self.matcher;
        let (added, duplicates) = self
            .ledger
            .update(move |state| {
                let mut seen = HashSet::new();
                let mut added = Vec::new();
                let mut duplicates = Vec::new();
                let mut fresh = Vec::new();
                for video in videos {
                    if state.contains_video(&video.id) || !seen.insert(video.id.clone()) {
                        duplicates.push(video.id);
                        continue;
                    }
                    added.push(video.id.clone());
                    fresh.push(video);
                }
                if fresh.is_empty() {
                    return (added, duplicates);
                }

                let mut pool = state.take_unpaired();
                pool.extend(fresh);
                let matched = matcher.match_videos(pool);
                state.pairs.extend(matched.pairs);
                state.unpaired_videos = matched.unpaired;
                (added, duplicates)
            })
            .await?;

        report.added = added;
        report.duplicates = duplicates;
        info!(
            added = report.added.len(),
            duplicates = report.duplicates.len(),
            failed = report.failed.len(),
            "Imported videos"
        );
        Ok(report)
    }

    /// Pair two unpaired videos by hand.
    pub async fn pair_videos(&self, a: &VideoId, b: &VideoId) -> WorkerResult<PairId> {
        self.ledger
            .try_update(|state| Ok(state.pair_videos(a, b)?))
            .await
    }

    /// Dissolve a pair, returning both members to the unpaired set.
    pub async fn unpair(&self, pair_id: &PairId) -> WorkerResult<()> {
        self.ledger.try_update(|state| Ok(state.unpair(pair_id)?)).await
    }

    /// Stop tracking videos. A removed pair member's partner becomes unpaired.
    ///
    /// Unknown IDs are skipped.
    pub async fn remove_videos(&self, ids: &[VideoId]) -> WorkerResult<Vec<Video>> {
        self.ledger
            .try_update(|state| {
                let mut removed = Vec::new();
                for id in ids {
                    match state.remove_video(id) {
                        Ok(video) => removed.push(video),
                        Err(ModelError::VideoNotFound(_)) => warn!(video_id = %id, "Not tracked, nothing to remove"),
                        Err(e) => return Err(WorkerError::from(e)),
                    }
                }
                Ok(removed)
            })
            .await
    }

    /// Drop every tracked video and pair.
    pub async fn clear(&self) -> WorkerResult<()> {
        self.ledger.clear().await
    }

    /// Process the given videos. Pair members are processed together even
    /// when only one of them is requested.
    ///
    /// Tool failures are reported per item in the batch report. A store
    /// failure while merging results is returned once the batch is done.
    pub async fn process(&self, ids: &[VideoId]) -> WorkerResult<ProcessReport> {
        let queued = self.ledger.update(|state| state.queue_for_processing(ids)).await?;
        if !queued.already_processing.is_empty() {
            warn!(videos = ?queued.already_processing, "Skipping videos already being processed");
        }
        if !queued.unknown.is_empty() {
            warn!(videos = ?queued.unknown, "Skipping unknown videos");
        }

        let mut report = ProcessReport {
            already_processing: queued.already_processing,
            unknown: queued.unknown,
            ..ProcessReport::default()
        };
        if queued.items.is_empty() {
            return Ok(report);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = LedgerSink::new(Arc::clone(&self.ledger));
        let merger = tokio::spawn(async move { sink.consume(rx).await });

        report.batch = self.orchestrator.process_batch(queued.items, tx).await;

        let merge_failure = merger
            .await
            .map_err(|e| WorkerError::internal(format!("event merger terminated: {}", e)))?;

        if report.batch.worker_faults > 0 {
            self.ledger.hub().publish(BoundaryEvent::processing_error(
                ErrorScope::Complete,
                format!(
                    "{} worker(s) terminated; {} item(s) failed",
                    report.batch.worker_faults,
                    report.batch.failures.len()
                ),
            ));
        }
        match merge_failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Handle videos left in `processing` by a previous run, per the
    /// configured policy. Under `resume` they are processed again before
    /// this returns.
    pub async fn recover(&self) -> WorkerResult<RecoveryReport> {
        let report = recover_orphans(&self.ledger, self.config.recovery_policy).await?;
        let resubmit = report.to_resubmit();
        if !resubmit.is_empty() {
            info!(count = resubmit.len(), "Resubmitting interrupted videos");
            self.process(resubmit).await?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryPolicy;
    use crate::runner::tests::FakeToolkit;
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;
    use vpair_models::{ProcessingStage, VideoStatus};
    use vpair_store::{KeyValueStore, MemoryStore, StoreError, StoreResult, UNPAIRED_VIDEOS_KEY};

    fn service_with(toolkit: FakeToolkit, policy: RecoveryPolicy) -> MediaService {
        let config = WorkerConfig {
            pool_size: 2,
            stages: vec![ProcessingStage::Metadata, ProcessingStage::SampleVideo, ProcessingStage::Alignment],
            recovery_policy: policy,
            ..WorkerConfig::default()
        };
        let repository = Arc::new(KvStateRepository::new(Arc::new(MemoryStore::new())));
        MediaService::new(config, repository, Arc::new(toolkit), Arc::new(EventHub::new()))
    }

    fn service() -> MediaService {
        service_with(FakeToolkit::default(), RecoveryPolicy::Resume)
    }

    fn touch(dir: &TempDir, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, b"video").unwrap();
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn test_import_pairs_and_dedupes() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        let paths = touch(&dir, &["a.mp4", "b.mp4"]);

        let report = svc.import_videos(&paths).await.unwrap();
        assert_eq!(report.added.len(), 2);
        let state = svc.state().await.unwrap();
        assert_eq!(state.pairs.len(), 1);
        assert!(state.unpaired_videos.is_empty());
        assert!(state.videos().all(|v| v.metadata.is_some() && v.size == 5));

        let mut again = paths.clone();
        again.push(dir.path().join("missing.mp4"));
        let report = svc.import_videos(&again).await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.duplicates.len(), 2);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_import_rematches_with_existing_unpaired() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        svc.import_videos(&touch(&dir, &["a.mp4"])).await.unwrap();
        assert_eq!(svc.state().await.unwrap().unpaired_videos.len(), 1);

        svc.import_videos(&touch(&dir, &["b.mp4"])).await.unwrap();
        let state = svc.state().await.unwrap();
        assert_eq!(state.pairs.len(), 1);
        assert!(state.validate().is_ok());
    }

    #[tokio::test]
    async fn test_import_keeps_videos_without_metadata() {
        let dir = TempDir::new().unwrap();
        let toolkit = FakeToolkit {
            bad_metadata: vec!["broken.mp4".into()],
            ..FakeToolkit::default()
        };
        let svc = service_with(toolkit, RecoveryPolicy::Resume);
        svc.import_videos(&touch(&dir, &["broken.mp4"])).await.unwrap();

        let state = svc.state().await.unwrap();
        let video = state.video(&"broken.mp4".into()).unwrap();
        assert_eq!(video.status, VideoStatus::Error);
        assert!(video.error.as_deref().unwrap().contains("moov atom"));
    }

    #[tokio::test]
    async fn test_manual_pairing_and_removal() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        svc.import_videos(&touch(&dir, &["a.mp4", "b.mp4"])).await.unwrap();
        let pair_id = svc.state().await.unwrap().pairs[0].id.clone();

        svc.unpair(&pair_id).await.unwrap();
        assert_eq!(svc.state().await.unwrap().unpaired_videos.len(), 2);

        let again = svc.pair_videos(&"a.mp4".into(), &"b.mp4".into()).await.unwrap();
        assert_eq!(again, pair_id);
        assert!(matches!(
            svc.pair_videos(&"a.mp4".into(), &"a.mp4".into()).await,
            Err(WorkerError::Model(ModelError::SelfPair(_)))
        ));

        let removed = svc.remove_videos(&["a.mp4".into(), "ghost.mp4".into()]).await.unwrap();
        assert_eq!(removed.len(), 1);
        let state = svc.state().await.unwrap();
        assert!(state.pairs.is_empty());
        assert_eq!(state.unpaired_videos[0].id, VideoId::from("b.mp4"));

        svc.clear().await.unwrap();
        assert!(svc.state().await.unwrap().is_empty());
    }

    /// Memory store that refuses any write touching the unpaired set.
    struct RejectUnpairedWrites(Arc<MemoryStore>);

    #[async_trait]
    impl KeyValueStore for RejectUnpairedWrites {
        async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
            if key == UNPAIRED_VIDEOS_KEY {
                return Err(StoreError::write_failed(key, "disk full"));
            }
            self.0.set(key, value).await
        }

        async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
            if entries.iter().any(|(key, _)| key == UNPAIRED_VIDEOS_KEY) {
                return Err(StoreError::write_failed(UNPAIRED_VIDEOS_KEY, "disk full"));
            }
            self.0.set_many(entries).await
        }

        async fn clear(&self) -> StoreResult<()> {
            self.0.clear().await
        }
    }

    #[tokio::test]
    async fn test_failed_save_leaves_stored_state_consistent() {
        let inner = Arc::new(MemoryStore::new());
        let stored = KvStateRepository::new(inner.clone());
        let now = Utc::now();
        stored
            .save_state(&ProcessingState::new(
                vec![],
                vec![Video::new("/in/a.mp4", now, 1), Video::new("/in/b.mp4", now, 2)],
            ))
            .await
            .unwrap();

        let repository = Arc::new(KvStateRepository::new(Arc::new(RejectUnpairedWrites(inner))));
        let svc = MediaService::new(
            WorkerConfig::default(),
            repository,
            Arc::new(FakeToolkit::default()),
            Arc::new(EventHub::new()),
        );
        assert!(svc.pair_videos(&"a.mp4".into(), &"b.mp4".into()).await.is_err());

        let state = stored.load_state().await.unwrap();
        assert!(state.validate().is_ok());
        assert!(state.pairs.is_empty());
        assert_eq!(state.unpaired_videos.len(), 2);
    }

    #[tokio::test]
    async fn test_process_marks_videos_processed() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        svc.import_videos(&touch(&dir, &["a.mp4", "b.mp4"])).await.unwrap();
        let mut events = svc.subscribe();

        // Requesting one member processes the whole pair
        let report = svc.process(&["a.mp4".into(), "nope.mp4".into()]).await.unwrap();
        assert_eq!(report.batch.results.len(), 1);
        assert_eq!(report.unknown, vec![VideoId::from("nope.mp4")]);

        let state = svc.state().await.unwrap();
        assert!(state.videos().all(|v| v.status == VideoStatus::Processed && v.preview.is_some()));
        assert_eq!(state.pairs[0].alignment.as_ref().unwrap().offset, 120.0);

        let mut saw_media_processed = false;
        while let Ok(event) = events.try_recv() {
            if let BoundaryEvent::MediaProcessed { results } = event {
                assert_eq!(results.len(), 1);
                saw_media_processed = true;
            }
        }
        assert!(saw_media_processed);
    }

    #[tokio::test]
    async fn test_process_failure_reverts_to_idle() {
        let dir = TempDir::new().unwrap();
        let svc = service_with(FakeToolkit::failing("a.mp4", "codec error"), RecoveryPolicy::Resume);
        svc.import_videos(&touch(&dir, &["a.mp4"])).await.unwrap();

        let report = svc.process(&["a.mp4".into()]).await.unwrap();
        assert_eq!(report.batch.failures.len(), 1);

        let state = svc.state().await.unwrap();
        let video = state.video(&"a.mp4".into()).unwrap();
        assert_eq!(video.status, VideoStatus::Idle);
        assert_eq!(video.error.as_deref(), Some("codec error"));
        assert!(video.start_processing_time.is_none());
    }

    #[tokio::test]
    async fn test_worker_fault_raises_complete_error() {
        let dir = TempDir::new().unwrap();
        let svc = service_with(FakeToolkit::panicking("boom.mp4"), RecoveryPolicy::Resume);
        svc.import_videos(&touch(&dir, &["boom.mp4"])).await.unwrap();
        let mut events = svc.subscribe();

        let report = svc.process(&["boom.mp4".into()]).await.unwrap();
        assert_eq!(report.batch.worker_faults, 1);

        let mut saw_complete_error = false;
        while let Ok(event) = events.try_recv() {
            if let BoundaryEvent::ProcessingError { scope: ErrorScope::Complete, .. } = event {
                saw_complete_error = true;
            }
        }
        assert!(saw_complete_error);
        let state = svc.state().await.unwrap();
        assert_eq!(state.video(&"boom.mp4".into()).unwrap().status, VideoStatus::Idle);
    }

    #[tokio::test]
    async fn test_process_skips_videos_in_flight() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        svc.import_videos(&touch(&dir, &["a.mp4"])).await.unwrap();
        svc.ledger
            .update(|s| s.queue_for_processing(&["a.mp4".into()]))
            .await
            .unwrap();

        let report = svc.process(&["a.mp4".into()]).await.unwrap();
        assert_eq!(report.already_processing, vec![VideoId::from("a.mp4")]);
        assert_eq!(report.batch.total(), 0);
    }

    #[tokio::test]
    async fn test_recover_resumes_orphans() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        svc.import_videos(&touch(&dir, &["a.mp4"])).await.unwrap();
        svc.ledger
            .update(|s| s.queue_for_processing(&["a.mp4".into()]))
            .await
            .unwrap();

        let report = svc.recover().await.unwrap();
        assert_eq!(report.orphaned, vec![VideoId::from("a.mp4")]);
        let state = svc.state().await.unwrap();
        assert_eq!(state.video(&"a.mp4".into()).unwrap().status, VideoStatus::Processed);
    }

    #[tokio::test]
    async fn test_recover_reset_policy_leaves_videos_idle() {
        let dir = TempDir::new().unwrap();
        let svc = service_with(FakeToolkit::default(), RecoveryPolicy::Reset);
        svc.import_videos(&touch(&dir, &["a.mp4"])).await.unwrap();
        svc.ledger
            .update(|s| s.queue_for_processing(&["a.mp4".into()]))
            .await
            .unwrap();

        svc.recover().await.unwrap();
        let state = svc.state().await.unwrap();
        let video = state.video(&"a.mp4".into()).unwrap();
        assert_eq!(video.status, VideoStatus::Idle);
        assert!(video.error.is_some());
    }
}
