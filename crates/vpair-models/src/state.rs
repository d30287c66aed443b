//! Persisted processing state: pairs plus the unpaired set.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ModelError, ModelResult};
use crate::events::BatchItem;
use crate::pair::{Pair, PairId};
use crate::video::{Video, VideoId, VideoStatus};

/// Snapshot of every tracked video.
///
/// A video lives either in exactly one pair or in `unpaired_videos`, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    #[serde(default)]
    pub pairs: Vec<Pair>,
    #[serde(default)]
    pub unpaired_videos: Vec<Video>,
}

/// Items resolved for a processing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOutcome {
    /// Items queued (members now `processing` without a start time)
    pub items: Vec<BatchItem>,
    /// Requested IDs skipped because a job is already in flight for them
    pub already_processing: Vec<VideoId>,
    /// Requested IDs that are not tracked
    pub unknown: Vec<VideoId>,
}

impl ProcessingState {
    pub fn new(pairs: Vec<Pair>, unpaired_videos: Vec<Video>) -> Self {
        Self {
            pairs,
            unpaired_videos,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.unpaired_videos.is_empty()
    }

    /// Every tracked video, paired ones first.
    pub fn videos(&self) -> impl Iterator<Item = &Video> {
        self.pairs
            .iter()
            .flat_map(|p| p.members())
            .chain(self.unpaired_videos.iter())
    }

    pub fn video(&self, id: &VideoId) -> Option<&Video> {
        self.videos().find(|v| &v.id == id)
    }

    pub fn video_mut(&mut self, id: &VideoId) -> Option<&mut Video> {
        if let Some(pair) = self.pairs.iter_mut().find(|p| p.contains(id)) {
            return pair.member_mut(id);
        }
        self.unpaired_videos.iter_mut().find(|v| &v.id == id)
    }

    pub fn contains_video(&self, id: &VideoId) -> bool {
        self.video(id).is_some()
    }

    pub fn pair(&self, id: &PairId) -> Option<&Pair> {
        self.pairs.iter().find(|p| &p.id == id)
    }

    /// The pair a video belongs to, if any.
    pub fn pair_of(&self, video_id: &VideoId) -> Option<&Pair> {
        self.pairs.iter().find(|p| p.contains(video_id))
    }

    /// IDs of videos currently in `processing`.
    pub fn processing_video_ids(&self) -> Vec<VideoId> {
        self.videos()
            .filter(|v| v.status == VideoStatus::Processing)
            .map(|v| v.id.clone())
            .collect()
    }

    /// Add a video to the unpaired set. Returns `false` if the ID is already tracked.
    pub fn add_unpaired(&mut self, video: Video) -> bool {
        if self.contains_video(&video.id) {
            return false;
        }
        self.unpaired_videos.push(video);
        true
    }

    /// Drain the unpaired set (e.g. to re-run matching over it).
    pub fn take_unpaired(&mut self) -> Vec<Video> {
        std::mem::take(&mut self.unpaired_videos)
    }

    /// Explicitly pair two unpaired videos. The earlier one becomes the first member.
    pub fn pair_videos(&mut self, a: &VideoId, b: &VideoId) -> ModelResult<PairId> {
        if a == b {
            return Err(ModelError::SelfPair(a.to_string()));
        }
        for id in [a, b] {
            if self.pair_of(id).is_some() {
                return Err(ModelError::AlreadyPaired(id.to_string()));
            }
            if !self.contains_video(id) {
                return Err(ModelError::video_not_found(id.as_str()));
            }
        }

        let first = self.remove_unpaired(a)?;
        let second = self.remove_unpaired(b)?;
        let pair = if second.created_at < first.created_at {
            Pair::new(second, first)
        } else {
            Pair::new(first, second)
        };
        let id = pair.id.clone();
        self.pairs.push(pair);
        Ok(id)
    }

    /// Dissolve a pair, returning both members to the unpaired set.
    pub fn unpair(&mut self, pair_id: &PairId) -> ModelResult<()> {
        let index = self
            .pairs
            .iter()
            .position(|p| &p.id == pair_id)
            .ok_or_else(|| ModelError::pair_not_found(pair_id.as_str()))?;
        let (first, second) = self.pairs.remove(index).into_members();
        self.unpaired_videos.push(first);
        self.unpaired_videos.push(second);
        Ok(())
    }

    /// Stop tracking a video. A removed pair member's partner becomes unpaired.
    pub fn remove_video(&mut self, id: &VideoId) -> ModelResult<Video> {
        if let Some(index) = self.pairs.iter().position(|p| p.contains(id)) {
            let (first, second) = self.pairs.remove(index).into_members();
            let (removed, partner) = if &first.id == id {
                (first, second)
            } else {
                (second, first)
            };
            self.unpaired_videos.push(partner);
            return Ok(removed);
        }
        self.remove_unpaired(id)
    }

    /// Resolve requested IDs into batch items, grouping pair members, and
    /// queue their videos.
    ///
    /// A pair is submitted once even if both members are requested. Items
    /// with any member already in `processing` are skipped so that a video
    /// never has two jobs in flight.
    pub fn queue_for_processing(&mut self, ids: &[VideoId]) -> QueueOutcome {
        let mut outcome = QueueOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for id in ids {
            let item = match self.pair_of(id) {
                Some(pair) => BatchItem::Pair(pair.clone()),
                None => match self.unpaired_videos.iter().find(|v| &v.id == id) {
                    Some(video) => BatchItem::Video(video.clone()),
                    None => {
                        outcome.unknown.push(id.clone());
                        continue;
                    }
                },
            };

            if !seen.insert(item.id()) {
                continue;
            }

            let busy: Vec<VideoId> = item
                .videos()
                .into_iter()
                .filter(|v| v.status == VideoStatus::Processing)
                .map(|v| v.id.clone())
                .collect();
            if !busy.is_empty() {
                outcome.already_processing.extend(busy);
                continue;
            }

            let mut item = item;
            for video in item.videos_mut() {
                // Cannot fail: busy members were filtered out above
                let _ = video.queue();
            }
            self.apply_item(&item);
            outcome.items.push(item);
        }

        outcome
    }

    /// Merge a batch item's processing fields into the stored records.
    ///
    /// Returns the number of stored videos that were updated. Videos removed
    /// while the job was running are ignored.
    pub fn apply_item(&mut self, item: &BatchItem) -> usize {
        let mut updated = 0;
        for incoming in item.videos() {
            if let Some(stored) = self.video_mut(&incoming.id) {
                merge_processing_fields(stored, incoming);
                updated += 1;
            }
        }
        if let BatchItem::Pair(pair) = item {
            if let Some(stored) = self.pairs.iter_mut().find(|p| p.id == pair.id) {
                if pair.alignment.is_some() {
                    stored.alignment = pair.alignment.clone();
                }
            }
        }
        updated
    }

    /// Check that no video is tracked twice and no pair is degenerate.
    pub fn validate(&self) -> ModelResult<()> {
        let mut seen = HashSet::new();
        for pair in &self.pairs {
            if pair.video1.id == pair.video2.id {
                return Err(ModelError::SelfPair(pair.video1.id.to_string()));
            }
        }
        for video in self.videos() {
            if !seen.insert(&video.id) {
                return Err(ModelError::DuplicateVideo(video.id.to_string()));
            }
        }
        Ok(())
    }

    /// Drop duplicate records so every video is tracked once.
    ///
    /// The first pair holding a video wins. Later or degenerate pairs are
    /// dissolved into the unpaired set, and unpaired copies of a video
    /// already tracked are dropped. Returns the IDs of dropped records.
    pub fn repair(&mut self) -> Vec<VideoId> {
        let mut seen = HashSet::new();
        let mut dropped = Vec::new();
        let mut freed = Vec::new();
        for pair in std::mem::take(&mut self.pairs) {
            let clash = pair.video1.id == pair.video2.id
                || seen.contains(&pair.video1.id)
                || seen.contains(&pair.video2.id);
            if clash {
                freed.push(pair.video1);
                freed.push(pair.video2);
                continue;
            }
            seen.insert(pair.video1.id.clone());
            seen.insert(pair.video2.id.clone());
            self.pairs.push(pair);
        }
        let unpaired = std::mem::take(&mut self.unpaired_videos);
        for video in freed.into_iter().chain(unpaired) {
            if seen.insert(video.id.clone()) {
                self.unpaired_videos.push(video);
            } else {
                dropped.push(video.id);
            }
        }
        dropped
    }

    fn remove_unpaired(&mut self, id: &VideoId) -> ModelResult<Video> {
        let index = self
            .unpaired_videos
            .iter()
            .position(|v| &v.id == id)
            .ok_or_else(|| ModelError::video_not_found(id.as_str()))?;
        Ok(self.unpaired_videos.remove(index))
    }
}

fn merge_processing_fields(stored: &mut Video, incoming: &Video) {
    stored.status = incoming.status;
    stored.start_processing_time = incoming.start_processing_time;
    stored.processing_time = incoming.processing_time;
    stored.error = incoming.error.clone();
    stored.preview = incoming.preview.clone();
    if incoming.metadata.is_some() {
        stored.metadata = incoming.metadata.clone();
    }
}
