//! Nearest-neighbour pairing of videos by creation time.
//!
//! Two cameras recording the same event produce files whose creation
//! timestamps are close together. The matcher walks the videos in timestamp
//! order and greedily pairs each one with the closest unmatched video within
//! a ceiling. The result is deterministic, not globally optimal.

use chrono::Duration;

use crate::pair::Pair;
use crate::video::Video;

/// Default maximum gap between two paired videos, in seconds.
pub const DEFAULT_MAX_PAIRING_GAP_SECS: i64 = 30;

/// Outcome of a matching pass. Every input video ends up in exactly one of
/// the two collections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub pairs: Vec<Pair>,
    pub unpaired: Vec<Video>,
}

/// Greedy nearest-neighbour matcher.
#[derive(Debug, Clone, Copy)]
pub struct VideoMatcher {
    max_gap: Duration,
}

impl Default for VideoMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAIRING_GAP_SECS)
    }
}

impl VideoMatcher {
    pub fn new(max_gap_secs: i64) -> Self {
        Self {
            max_gap: Duration::seconds(max_gap_secs.max(0)),
        }
    }

    pub fn max_gap(&self) -> Duration {
        self.max_gap
    }

    /// Partition `videos` into pairs and leftovers.
    pub fn match_videos(&self, mut videos: Vec<Video>) -> MatchOutcome {
        // Stable: equal timestamps keep their input order
        videos.sort_by_key(|v| v.created_at);

        let n = videos.len();
        let mut partner: Vec<Option<usize>> = vec![None; n];
        let mut consumed = vec![false; n];

        for i in 0..n {
            if consumed[i] {
                continue;
            }
            let mut best: Option<(usize, Duration)> = None;
            for j in 0..n {
                if j == i || consumed[j] {
                    continue;
                }
                let gap = (videos[j].created_at - videos[i].created_at).abs();
                if gap > self.max_gap {
                    continue;
                }
                // Strict comparison: the first candidate wins ties
                if best.map_or(true, |(_, best_gap)| gap < best_gap) {
                    best = Some((j, gap));
                }
            }
            if let Some((j, _)) = best {
                consumed[i] = true;
                consumed[j] = true;
                partner[i] = Some(j);
            }
        }

        let mut slots: Vec<Option<Video>> = videos.into_iter().map(Some).collect();
        let mut outcome = MatchOutcome::default();
        for i in 0..n {
            if let Some(j) = partner[i] {
                if let (Some(first), Some(second)) = (slots[i].take(), slots[j].take()) {
                    outcome.pairs.push(Pair::new(first, second));
                }
            }
        }
        outcome.unpaired = slots.into_iter().flatten().collect();
        outcome
    }
}
