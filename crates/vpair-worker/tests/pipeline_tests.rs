//! End-to-end tests against stand-in tools and a JSON state file.

#![cfg(unix)]

use chrono::{Duration, Utc};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use vpair_models::{BoundaryEvent, ProcessingStage, ProcessingState, Video, VideoId, VideoStatus};
use vpair_store::{JsonFileStore, KvStateRepository, StateRepository};
use vpair_worker::{MediaService, RecoveryPolicy, WorkerConfig};

const SAMPLE_TOOL: &str = r#"
out=""; name=""; input=""
while [ $# -gt 0 ]; do
  case "$1" in
    -i) input="$2"; shift ;;
    -o) out="$2"; shift ;;
    --output-filename) name="$2"; shift ;;
  esac
  shift
done
case "$input" in
  *broken*) echo "invalid data found when processing input" >&2; exit 1 ;;
esac
echo '{"v":1,"kind":"progress","stage":"video","percent":50}'
touch "$out/$name"
echo "{\"v\":1,\"kind\":\"complete\",\"output\":\"$out/$name\"}"
"#;

const METADATA_TOOL: &str = r#"echo "probing $2"
echo '{"fps": 30.0, "duration": 4.0, "frame_count": 120, "width": 1280, "height": 720, "checksum": "abc"}'"#;

const ALIGNMENT_TOOL: &str = r#"echo '{"target": "b.mp4", "offset": 1500, "confidence": 7.5, "elapsed_time_seconds": 0.2}' > "$5""#;

struct Fixture {
    dir: TempDir,
    config: WorkerConfig,
}

impl Fixture {
    fn new(policy: RecoveryPolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let tools = dir.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        let config = WorkerConfig {
            pool_size: 2,
            output_dir: dir.path().join("out"),
            state_file: dir.path().join("state").join("vpair-state.json"),
            sample_video_tool: script(&tools, "sample", SAMPLE_TOOL),
            metadata_tool: Some(script(&tools, "meta", METADATA_TOOL)),
            alignment_tool: script(&tools, "align", ALIGNMENT_TOOL),
            stages: ProcessingStage::ALL.to_vec(),
            recovery_policy: policy,
            ..WorkerConfig::default()
        };
        Self { dir, config }
    }

    fn service(&self) -> MediaService {
        MediaService::from_config(self.config.clone())
    }

    fn repository(&self) -> KvStateRepository {
        KvStateRepository::new(Arc::new(JsonFileStore::new(&self.config.state_file)))
    }

    fn videos(&self, names: &[&str]) -> Vec<PathBuf> {
        let inputs = self.dir.path().join("in");
        std::fs::create_dir_all(&inputs).unwrap();
        names
            .iter()
            .map(|name| {
                let path = inputs.join(name);
                std::fs::write(&path, b"raw footage").unwrap();
                path
            })
            .collect()
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Import a pair, process it, and read the result back from disk.
#[tokio::test]
async fn test_import_and_process_pair() {
    let fixture = Fixture::new(RecoveryPolicy::Resume);
    let service = fixture.service();
    let mut events = service.subscribe();

    let report = service.import_videos(&fixture.videos(&["a.mp4", "b.mp4"])).await.unwrap();
    assert_eq!(report.added.len(), 2);

    let state = service.state().await.unwrap();
    assert_eq!(state.pairs.len(), 1);
    assert_eq!(state.pairs[0].video1.metadata.as_ref().unwrap().frame_count, 120);

    let result = service.process(&[VideoId::from("b.mp4")]).await.unwrap();
    assert_eq!(result.batch.results.len(), 1);
    assert!(result.batch.failures.is_empty());
    drop(service);

    // Persisted state survives a fresh service
    let state = fixture.service().state().await.unwrap();
    let pair = &state.pairs[0];
    for video in pair.members() {
        assert_eq!(video.status, VideoStatus::Processed);
        assert!(video.preview.as_ref().unwrap().exists());
        assert!(video.start_processing_time.is_some());
        assert!(video.processing_time.is_some());
    }
    let alignment = pair.alignment.as_ref().unwrap();
    assert_eq!(alignment.target, "b.mp4");
    assert_eq!(alignment.offset, 1500.0);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            BoundaryEvent::VideosUpdated { .. } => "videos-updated",
            BoundaryEvent::MediaProcessed { .. } => "media-processed",
            BoundaryEvent::ProcessingError { .. } => "processing-error",
        });
    }
    assert!(kinds.contains(&"videos-updated"));
    assert_eq!(kinds.iter().filter(|k| **k == "media-processed").count(), 1);
    assert!(!kinds.contains(&"processing-error"));
}

/// A failing tool reverts its item without affecting the rest of the batch.
#[tokio::test]
async fn test_tool_failure_is_isolated() {
    let mut fixture = Fixture::new(RecoveryPolicy::Resume);
    fixture.config.max_pairing_gap_secs = 0;
    fixture.config.stages = vec![ProcessingStage::SampleVideo];
    let service = fixture.service();

    let paths = fixture.videos(&["good.mp4", "broken.mp4"]);
    service.import_videos(&paths[..1]).await.unwrap();
    service.import_videos(&paths[1..]).await.unwrap();
    // Identical timestamps still pair at a zero gap; keep them separate
    let state = service.state().await.unwrap();
    if let Some(pair) = state.pairs.first() {
        service.unpair(&pair.id).await.unwrap();
    }

    let result = service
        .process(&[VideoId::from("good.mp4"), VideoId::from("broken.mp4")])
        .await
        .unwrap();
    assert_eq!(result.batch.results.len(), 1);
    assert_eq!(result.batch.failures.len(), 1);

    let state = service.state().await.unwrap();
    let good = state.video(&"good.mp4".into()).unwrap();
    assert_eq!(good.status, VideoStatus::Processed);
    let broken = state.video(&"broken.mp4".into()).unwrap();
    assert_eq!(broken.status, VideoStatus::Idle);
    assert!(broken.start_processing_time.is_none());
    assert!(broken.error.as_deref().unwrap().contains("invalid data"));
}

/// Videos persisted as processing are reset on startup, then resumed.
#[tokio::test]
async fn test_recovery_after_crash() {
    for policy in [RecoveryPolicy::Resume, RecoveryPolicy::Reset] {
        let fixture = Fixture::new(policy);
        let paths = fixture.videos(&["a.mp4"]);

        let mut running = Video::new(&paths[0], Utc::now() - Duration::minutes(5), 11);
        running.queue().unwrap();
        running.begin(Utc::now()).unwrap();
        fixture
            .repository()
            .save_state(&ProcessingState::new(vec![], vec![running]))
            .await
            .unwrap();

        let service = fixture.service();
        let report = service.recover().await.unwrap();
        assert_eq!(report.orphaned, vec![VideoId::from("a.mp4")]);

        let state = service.state().await.unwrap();
        let video = state.video(&"a.mp4".into()).unwrap();
        match policy {
            RecoveryPolicy::Resume => {
                assert_eq!(video.status, VideoStatus::Processed);
                assert!(video.preview.is_some());
            }
            RecoveryPolicy::Reset => {
                assert_eq!(video.status, VideoStatus::Idle);
                assert!(video.error.is_some());
            }
        }
        assert!(state.processing_video_ids().is_empty());
    }
}

/// A supervised process reporting over the line protocol.
#[tokio::test]
async fn test_supervised_process_round_trip() {
    let fixture = Fixture::new(RecoveryPolicy::Resume);
    let service = fixture.service();
    service.import_videos(&fixture.videos(&["a.mp4"])).await.unwrap();

    let tools = fixture.dir.path().join("tools");
    let tool = script(
        &tools,
        "render",
        r#"echo "PROGRESS:$VPAIR_PROCESS_ID:thumbnail:100" >&2
echo "PROGRESS:$VPAIR_PROCESS_ID:video:100"
echo "all done COMPLETE:$VPAIR_PROCESS_ID:$1""#,
    );

    let supervisor = service.supervisor();
    let pid = supervisor
        .start(&VideoId::from("a.mp4"), &tool, &["/out/rendered.mp4".to_string()])
        .await
        .unwrap();
    let job = supervisor.wait(&pid).await.unwrap();
    assert_eq!(job.progress.len(), 2);
    assert_eq!(job.overall_progress(), 100);

    let state = service.state().await.unwrap();
    let video = state.video(&"a.mp4".into()).unwrap();
    assert_eq!(video.status, VideoStatus::Processed);
    assert_eq!(video.preview, Some(PathBuf::from("/out/rendered.mp4")));
}
