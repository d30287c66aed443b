//! Shared data models for the VPair engine.
//!
//! This crate provides Serde-serializable types for:
//! - Videos and their processing lifecycle
//! - Pairs of videos and alignment results
//! - The persisted processing state (pairs + unpaired videos)
//! - Supervised process jobs
//! - Worker and boundary event schemas
//! - The nearest-neighbour video matcher

pub mod error;
pub mod events;
pub mod job;
pub mod matching;
pub mod pair;
pub mod state;
pub mod video;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use events::{BatchItem, BoundaryEvent, ErrorScope, JobEvent, ProcessingStage};
pub use job::{JobStatus, ProcessId, ProcessingJob};
pub use matching::{MatchOutcome, VideoMatcher, DEFAULT_MAX_PAIRING_GAP_SECS};
pub use pair::{Alignment, Pair, PairId};
pub use state::{ProcessingState, QueueOutcome};
pub use video::{MediaMetadata, Video, VideoId, VideoStatus};
