//! Pairs of videos that depict the same event.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::video::{Video, VideoId};

/// Pair identifier, derived from the two member IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PairId(pub String);

impl PairId {
    /// Build the ID for two members (order matters: first member first).
    pub fn from_members(first: &VideoId, second: &VideoId) -> Self {
        Self(format!("{}__{}", first, second))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PairId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of the cross-video audio alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Alignment {
    /// File that must be shifted to line up with the other
    pub target: String,
    /// Offset in milliseconds
    pub offset: f64,
    /// Alignment confidence (ranking)
    pub confidence: f64,
    /// Time spent computing the alignment
    pub elapsed_time_seconds: f64,
}

/// Two videos processed and exported together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pair {
    pub id: PairId,
    pub video1: Video,
    pub video2: Video,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<Alignment>,
}

impl Pair {
    /// Create a pair; the ID is derived from the member IDs.
    pub fn new(video1: Video, video2: Video) -> Self {
        Self {
            id: PairId::from_members(&video1.id, &video2.id),
            video1,
            video2,
            created_at: Utc::now(),
            alignment: None,
        }
    }

    /// Whether the given video is a member of this pair.
    pub fn contains(&self, video_id: &VideoId) -> bool {
        &self.video1.id == video_id || &self.video2.id == video_id
    }

    pub fn member(&self, video_id: &VideoId) -> Option<&Video> {
        self.members().into_iter().find(|v| &v.id == video_id)
    }

    pub fn member_mut(&mut self, video_id: &VideoId) -> Option<&mut Video> {
        if &self.video1.id == video_id {
            Some(&mut self.video1)
        } else if &self.video2.id == video_id {
            Some(&mut self.video2)
        } else {
            None
        }
    }

    pub fn members(&self) -> [&Video; 2] {
        [&self.video1, &self.video2]
    }

    pub fn members_mut(&mut self) -> [&mut Video; 2] {
        [&mut self.video1, &mut self.video2]
    }

    /// Split the pair back into its members.
    pub fn into_members(self) -> (Video, Video) {
        (self.video1, self.video2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_id_is_derived_from_members() {
        let a = Video::new("/in/a.mp4", Utc::now(), 1);
        let b = Video::new("/in/b.mp4", Utc::now(), 1);
        let pair = Pair::new(a, b);
        assert_eq!(pair.id.as_str(), "a.mp4__b.mp4");
        assert!(pair.contains(&VideoId::from("a.mp4")));
        assert!(!pair.contains(&VideoId::from("c.mp4")));
    }

    #[test]
    fn test_member_mut() {
        let a = Video::new("/in/a.mp4", Utc::now(), 1);
        let b = Video::new("/in/b.mp4", Utc::now(), 1);
        let mut pair = Pair::new(a, b);
        pair.member_mut(&VideoId::from("b.mp4")).unwrap().name = "renamed".into();
        assert_eq!(pair.video2.name, "renamed");
    }
}
