//! Batch orchestrator: fans items out to a pool of workers.
//!
//! Workers pull items from a shared queue and run them one at a time;
//! workers run concurrently. Every submitted item gets exactly one terminal
//! event, even when a worker dies mid-item, and one `complete` event closes
//! the batch.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use vpair_models::{BatchItem, JobEvent};

use crate::events::EventEmitter;
use crate::runner::{revert, JobRunner};

/// Error attached to items whose worker died before reporting.
pub const WORKER_FAULT_MESSAGE: &str = "worker terminated before reporting a result";

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Items that finished successfully, as emitted in `update` events
    pub results: Vec<BatchItem>,
    /// Items that ended in an `error` event (including synthesized ones)
    pub failures: Vec<BatchItem>,
    /// Workers that panicked
    pub worker_faults: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len() + self.failures.len()
    }
}

/// Runs batches of items on a fixed-size worker pool.
pub struct BatchOrchestrator {
    runner: Arc<JobRunner>,
    pool_size: usize,
}

impl BatchOrchestrator {
    pub fn new(runner: Arc<JobRunner>, pool_size: usize) -> Self {
        Self {
            runner,
            pool_size: pool_size.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Process `items`, forwarding every job event to `sink`.
    ///
    /// Resolves once every item has a terminal event. Items sharing an ID
    /// with an earlier item are dropped.
    pub async fn process_batch(&self, items: Vec<BatchItem>, sink: mpsc::UnboundedSender<JobEvent>) -> BatchReport {
        let sink = EventEmitter::new(sink);
        let submitted = dedupe(items);
        let workers = self.pool_size.min(submitted.len()).max(1);
        info!(items = submitted.len(), workers, "Starting batch");

        let queue = Arc::new(Mutex::new(submitted.iter().cloned().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&self.runner);
            let events = EventEmitter::new(tx.clone());
            pool.spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some(item) = next else { break };
                    debug!(worker, item_id = %item.id(), "Worker picked up item");
                    runner.run(item, &events).await;
                }
            });
        }
        drop(tx);

        // Forward events until every worker has dropped its sender
        let mut report = BatchReport::default();
        let mut terminal: HashSet<String> = HashSet::new();
        while let Some(event) = rx.recv().await {
            match &event {
                JobEvent::Update { item } => {
                    terminal.insert(item.id());
                    report.results.push(item.clone());
                }
                JobEvent::Error { item, .. } => {
                    terminal.insert(item.id());
                    report.failures.push(item.clone());
                }
                _ => {}
            }
            sink.emit(event);
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                report.worker_faults += 1;
                metrics::counter!("vpair_worker_faults_total").increment(1);
                error!("Batch worker terminated abnormally: {}", e);
            }
        }

        for mut item in submitted {
            if terminal.contains(&item.id()) {
                continue;
            }
            warn!(item_id = %item.id(), "No terminal event received, failing item");
            revert(&mut item, WORKER_FAULT_MESSAGE);
            report.failures.push(item.clone());
            sink.emit(JobEvent::Error {
                item,
                message: WORKER_FAULT_MESSAGE.to_string(),
            });
        }

        info!(
            succeeded = report.results.len(),
            failed = report.failures.len(),
            worker_faults = report.worker_faults,
            "Batch finished"
        );
        sink.emit(JobEvent::Complete {
            results: report.results.clone(),
        });
        report
    }
}

fn dedupe(items: Vec<BatchItem>) -> Vec<BatchItem> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.id()) {
            warn!(item_id = %item.id(), "Duplicate item in batch ignored");
            continue;
        }
        unique.push(item);
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{video, FakeToolkit};
    use vpair_models::{Pair, ProcessingStage, VideoStatus};

    fn orchestrator(toolkit: FakeToolkit, pool_size: usize) -> BatchOrchestrator {
        let runner = JobRunner::new(Arc::new(toolkit), vec![ProcessingStage::SampleVideo]);
        BatchOrchestrator::new(Arc::new(runner), pool_size)
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn terminal_count(events: &[JobEvent], id: &str) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, JobEvent::Update { .. } | JobEvent::Error { .. }))
            .filter(|e| e.item_id().as_deref() == Some(id))
            .count()
    }

    #[tokio::test]
    async fn test_every_item_gets_one_terminal_event() {
        let items: Vec<BatchItem> = (0..7).map(|i| BatchItem::Video(video(&format!("v{i}.mp4")))).collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let report = orchestrator(FakeToolkit::failing("v3.mp4", "codec error"), 3)
            .process_batch(items, tx)
            .await;

        assert_eq!(report.results.len(), 6);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.worker_faults, 0);

        let events = drain(rx);
        for i in 0..7 {
            assert_eq!(terminal_count(&events, &format!("v{i}.mp4")), 1);
        }
        match events.last().unwrap() {
            JobEvent::Complete { results } => assert_eq!(results.len(), 6),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_per_item_event_order() {
        let items = vec![
            BatchItem::Pair(Pair::new(video("a.mp4"), video("b.mp4"))),
            BatchItem::Video(video("c.mp4")),
        ];
        let (tx, rx) = mpsc::unbounded_channel();
        orchestrator(FakeToolkit::default(), 2).process_batch(items, tx).await;
        let events = drain(rx);

        for id in ["a.mp4__b.mp4", "c.mp4"] {
            let kinds: Vec<&str> = events
                .iter()
                .filter(|e| e.item_id().as_deref() == Some(id))
                .map(|e| e.as_str())
                .collect();
            assert_eq!(kinds.first(), Some(&"init"));
            assert_eq!(kinds.last(), Some(&"update"));
            assert!(kinds[1..kinds.len() - 1].iter().all(|k| *k == "progress"));
        }
    }

    #[tokio::test]
    async fn test_worker_fault_synthesizes_errors() {
        let items: Vec<BatchItem> = ["a.mp4", "boom.mp4", "c.mp4"]
            .iter()
            .map(|n| BatchItem::Video(video(n)))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let report = orchestrator(FakeToolkit::panicking("boom.mp4"), 1)
            .process_batch(items, tx)
            .await;

        assert_eq!(report.worker_faults, 1);
        // The only worker died on boom.mp4; a.mp4 had already finished
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].id(), "a.mp4");
        assert_eq!(report.failures.len(), 2);

        let events = drain(rx);
        for id in ["a.mp4", "boom.mp4", "c.mp4"] {
            assert_eq!(terminal_count(&events, id), 1, "item {id}");
        }
        let synthesized = events.iter().find_map(|e| match e {
            JobEvent::Error { item, message } if item.id() == "boom.mp4" => Some((item, message)),
            _ => None,
        });
        let (item, message) = synthesized.unwrap();
        assert_eq!(message, WORKER_FAULT_MESSAGE);
        assert_eq!(item.videos()[0].status, VideoStatus::Idle);
    }

    #[tokio::test]
    async fn test_duplicates_and_empty_batches() {
        let (tx, rx) = mpsc::unbounded_channel();
        let report = orchestrator(FakeToolkit::default(), 4)
            .process_batch(vec![BatchItem::Video(video("a.mp4")), BatchItem::Video(video("a.mp4"))], tx)
            .await;
        assert_eq!(report.total(), 1);
        assert_eq!(terminal_count(&drain(rx), "a.mp4"), 1);

        let (tx, rx) = mpsc::unbounded_channel();
        let report = orchestrator(FakeToolkit::default(), 4).process_batch(vec![], tx).await;
        assert_eq!(report.total(), 0);
        assert!(matches!(drain(rx).as_slice(), [JobEvent::Complete { .. }]));
    }
}
