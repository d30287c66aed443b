//! Startup recovery of videos orphaned in `processing`.
//!
//! A video persisted as `processing` has no live job after a restart. It is
//! always reset to `idle` here; whether it is then resubmitted is up to the
//! caller and the configured policy.

use tracing::{info, warn};
use vpair_models::{ProcessingState, VideoId};

use crate::config::RecoveryPolicy;
use crate::error::WorkerResult;
use crate::ledger::StateLedger;

/// Error recorded on videos reset without resubmission.
pub const INTERRUPTED_MESSAGE: &str = "Processing was interrupted";

/// Videos found orphaned by a recovery pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub policy: Option<RecoveryPolicy>,
    /// Videos reset from `processing` to `idle`
    pub orphaned: Vec<VideoId>,
}

impl RecoveryReport {
    /// IDs to resubmit under the policy (empty for `reset`).
    pub fn to_resubmit(&self) -> &[VideoId] {
        match self.policy {
            Some(RecoveryPolicy::Resume) => &self.orphaned,
            _ => &[],
        }
    }
}

/// Reset every `processing` video in `state` to idle. Returns their IDs.
pub fn reset_processing(state: &mut ProcessingState, reason: Option<&str>) -> Vec<VideoId> {
    let orphaned = state.processing_video_ids();
    for id in &orphaned {
        if let Some(video) = state.video_mut(id) {
            video.reset(reason.map(str::to_string));
        }
    }
    orphaned
}

/// Reset orphaned videos according to `policy`.
///
/// Under `resume` the reset carries no error so the resubmitted run starts
/// clean; under `reset` the videos keep an "interrupted" message.
pub async fn recover_orphans(ledger: &StateLedger, policy: RecoveryPolicy) -> WorkerResult<RecoveryReport> {
    let snapshot = ledger.snapshot().await?;
    if snapshot.processing_video_ids().is_empty() {
        return Ok(RecoveryReport {
            policy: Some(policy),
            orphaned: Vec::new(),
        });
    }

    let reason = match policy {
        RecoveryPolicy::Resume => None,
        RecoveryPolicy::Reset => Some(INTERRUPTED_MESSAGE),
    };
    let orphaned = ledger.update(|state| reset_processing(state, reason)).await?;

    if !orphaned.is_empty() {
        warn!(count = orphaned.len(), policy = %policy, "Recovered orphaned videos");
    } else {
        info!("No orphaned videos");
    }
    Ok(RecoveryReport {
        policy: Some(policy),
        orphaned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use chrono::Utc;
    use std::sync::Arc;
    use vpair_models::{Video, VideoStatus};
    use vpair_store::{KvStateRepository, MemoryStore};

    async fn ledger_with_orphans() -> StateLedger {
        let repo = Arc::new(KvStateRepository::new(Arc::new(MemoryStore::new())));
        let ledger = StateLedger::new(repo, Arc::new(EventHub::new()));
        ledger
            .update(|s| {
                for name in ["a.mp4", "b.mp4", "c.mp4"] {
                    s.add_unpaired(Video::new(format!("/in/{name}"), Utc::now(), 1));
                }
                let mut running = s.queue_for_processing(&["a.mp4".into(), "b.mp4".into()]);
                // a.mp4 was running, b.mp4 only queued
                if let Some(v) = running.items[0].videos_mut().pop() {
                    v.begin(Utc::now()).unwrap();
                }
                s.apply_item(&running.items[0]);
            })
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_reset_policy_marks_interrupted() {
        let ledger = ledger_with_orphans().await;
        let report = recover_orphans(&ledger, RecoveryPolicy::Reset).await.unwrap();
        assert_eq!(report.orphaned.len(), 2);
        assert!(report.to_resubmit().is_empty());

        let state = ledger.snapshot().await.unwrap();
        assert!(state.processing_video_ids().is_empty());
        let a = state.video(&"a.mp4".into()).unwrap();
        assert_eq!(a.status, VideoStatus::Idle);
        assert_eq!(a.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(a.start_processing_time.is_none());
        assert!(state.video(&"c.mp4".into()).unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_resume_policy_lists_resubmissions() {
        let ledger = ledger_with_orphans().await;
        let report = recover_orphans(&ledger, RecoveryPolicy::Resume).await.unwrap();
        let mut ids: Vec<String> = report.to_resubmit().iter().map(|id| id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a.mp4", "b.mp4"]);

        let state = ledger.snapshot().await.unwrap();
        assert!(state.videos().all(|v| v.status == VideoStatus::Idle && v.error.is_none()));
    }

    #[tokio::test]
    async fn test_nothing_to_recover() {
        let repo = Arc::new(KvStateRepository::new(Arc::new(MemoryStore::new())));
        let ledger = StateLedger::new(repo, Arc::new(EventHub::new()));
        let report = recover_orphans(&ledger, RecoveryPolicy::Resume).await.unwrap();
        assert!(report.orphaned.is_empty());
    }
}
