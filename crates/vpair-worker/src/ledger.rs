//! Single merge point for persisted state.
//!
//! Every mutation of the processing state (batch events, supervisor
//! outcomes, imports, recovery) goes through [`StateLedger::update`], which
//! holds one lock across load, mutate and save. Each successful write
//! publishes a `videos-updated` snapshot.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};
use vpair_models::{BatchItem, BoundaryEvent, ErrorScope, JobEvent, ProcessingState};
use vpair_store::StateRepository;

use crate::error::{WorkerError, WorkerResult};
use crate::events::EventHub;

/// Serialized read-modify-write access to the processing state.
pub struct StateLedger {
    repository: Arc<dyn StateRepository>,
    hub: Arc<EventHub>,
    lock: Mutex<()>,
}

impl StateLedger {
    pub fn new(repository: Arc<dyn StateRepository>, hub: Arc<EventHub>) -> Self {
        Self {
            repository,
            hub,
            lock: Mutex::new(()),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Current persisted state.
    pub async fn snapshot(&self) -> WorkerResult<ProcessingState> {
        let _guard = self.lock.lock().await;
        Ok(self.repository.load_state().await?)
    }

    /// Apply an infallible mutation and persist it.
    pub async fn update<F, T>(&self, mutate: F) -> WorkerResult<T>
    where
        F: FnOnce(&mut ProcessingState) -> T,
    {
        self.try_update(|state| Ok(mutate(state))).await
    }

    /// Apply a fallible mutation. Nothing is written when it fails.
    pub async fn try_update<F, T>(&self, mutate: F) -> WorkerResult<T>
    where
        F: FnOnce(&mut ProcessingState) -> WorkerResult<T>,
    {
        let _guard = self.lock.lock().await;
        let mut state = self.repository.load_state().await?;
        let out = mutate(&mut state)?;
        self.repository.save_state(&state).await?;
        self.hub.publish(BoundaryEvent::VideosUpdated {
            pairs: state.pairs,
            unpaired_videos: state.unpaired_videos,
        });
        Ok(out)
    }

    /// Drop every persisted record.
    pub async fn clear(&self) -> WorkerResult<()> {
        let _guard = self.lock.lock().await;
        self.repository.clear().await?;
        self.hub.publish(BoundaryEvent::VideosUpdated {
            pairs: Vec::new(),
            unpaired_videos: Vec::new(),
        });
        Ok(())
    }
}

/// Consumes job events and merges them into the ledger.
pub struct LedgerSink {
    ledger: Arc<StateLedger>,
}

impl LedgerSink {
    pub fn new(ledger: Arc<StateLedger>) -> Self {
        Self { ledger }
    }

    /// Drain `events` until the sender side closes.
    ///
    /// A failed merge raises a `processing-error` of scope `media` and the
    /// remaining events are still applied. The first failure is returned.
    pub async fn consume(&self, mut events: mpsc::UnboundedReceiver<JobEvent>) -> Option<WorkerError> {
        let mut first_failure = None;
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply(&event).await {
                error!(event = event.as_str(), item_id = ?event.item_id(), "Failed to merge job event: {}", e);
                self.ledger
                    .hub()
                    .publish(BoundaryEvent::processing_error(ErrorScope::Media, e.to_string()));
                first_failure.get_or_insert(e);
            }
        }
        first_failure
    }

    /// Merge one event.
    pub async fn apply(&self, event: &JobEvent) -> WorkerResult<()> {
        match event {
            JobEvent::Init { item } | JobEvent::Update { item } | JobEvent::Error { item, .. } => {
                self.merge(item).await
            }
            JobEvent::Progress {
                item_id,
                stage,
                percent,
                detail,
            } => {
                debug!(item_id = %item_id, stage = %stage, detail = ?detail, percent, "Progress");
                Ok(())
            }
            JobEvent::Complete { results } => {
                self.ledger.hub().publish(BoundaryEvent::MediaProcessed {
                    results: results.clone(),
                });
                Ok(())
            }
        }
    }

    async fn merge(&self, item: &BatchItem) -> WorkerResult<()> {
        let updated = self.ledger.update(|state| state.apply_item(item)).await?;
        if updated == 0 {
            warn!(item_id = %item.id(), "Job event for an item no longer tracked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vpair_models::{Video, VideoStatus};
    use vpair_store::{KvStateRepository, MemoryStore, MockKeyValueStore, StoreError};

    fn ledger() -> Arc<StateLedger> {
        let repo = Arc::new(KvStateRepository::new(Arc::new(MemoryStore::new())));
        Arc::new(StateLedger::new(repo, Arc::new(EventHub::new())))
    }

    #[tokio::test]
    async fn test_update_persists_and_publishes() {
        let ledger = ledger();
        let mut rx = ledger.hub().subscribe();

        let added = ledger
            .update(|s| s.add_unpaired(Video::new("/in/a.mp4", Utc::now(), 1)))
            .await
            .unwrap();
        assert!(added);
        assert_eq!(ledger.snapshot().await.unwrap().unpaired_videos.len(), 1);

        match rx.recv().await.unwrap() {
            BoundaryEvent::VideosUpdated { unpaired_videos, .. } => assert_eq!(unpaired_videos.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let ledger = ledger();
        let result: WorkerResult<()> = ledger
            .try_update(|s| {
                s.add_unpaired(Video::new("/in/a.mp4", Utc::now(), 1));
                Err(WorkerError::internal("nope"))
            })
            .await;
        assert!(result.is_err());
        assert!(ledger.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let ledger = ledger();
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .update(move |s| s.add_unpaired(Video::new(format!("/in/{i}.mp4"), Utc::now(), 1)))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ledger.snapshot().await.unwrap().unpaired_videos.len(), 20);
    }

    #[tokio::test]
    async fn test_sink_merges_terminal_events() {
        let ledger = ledger();
        ledger
            .update(|s| s.add_unpaired(Video::new("/in/a.mp4", Utc::now(), 1)))
            .await
            .unwrap();
        let mut outcome = ledger.update(|s| s.queue_for_processing(&["a.mp4".into()])).await.unwrap();
        let mut item = outcome.items.remove(0);
        if let BatchItem::Video(v) = &mut item {
            v.begin(Utc::now()).unwrap();
            v.fail("codec error").unwrap();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(JobEvent::Error {
            item,
            message: "codec error".into(),
        })
        .unwrap();
        drop(tx);

        assert!(LedgerSink::new(ledger.clone()).consume(rx).await.is_none());
        let state = ledger.snapshot().await.unwrap();
        let video = &state.unpaired_videos[0];
        assert_eq!(video.status, VideoStatus::Idle);
        assert_eq!(video.error.as_deref(), Some("codec error"));
    }

    #[tokio::test]
    async fn test_store_failure_raises_media_error() {
        let mut store = MockKeyValueStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_set_many()
            .returning(|_| Err(StoreError::unavailable("disk full")));
        let repo = Arc::new(KvStateRepository::new(Arc::new(store)));
        let ledger = Arc::new(StateLedger::new(repo, Arc::new(EventHub::new())));
        let mut boundary = ledger.hub().subscribe();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(JobEvent::Update {
            item: BatchItem::Video(Video::new("/in/a.mp4", Utc::now(), 1)),
        })
        .unwrap();
        drop(tx);

        let failure = LedgerSink::new(ledger).consume(rx).await;
        assert!(matches!(failure, Some(e) if e.is_store_failure()));
        match boundary.recv().await.unwrap() {
            BoundaryEvent::ProcessingError { scope, .. } => assert_eq!(scope, ErrorScope::Media),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
