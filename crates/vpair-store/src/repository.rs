//! Load and save the processing state over a key-value store.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use vpair_models::ProcessingState;

use crate::error::{StoreError, StoreResult};
use crate::kv::KeyValueStore;

pub const PAIRS_KEY: &str = "pairs";
pub const UNPAIRED_VIDEOS_KEY: &str = "unpairedVideos";

/// Persistence boundary for the processing state.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Load the full state. A store with no state yields an empty one.
    async fn load_state(&self) -> StoreResult<ProcessingState>;

    /// Replace the full state.
    async fn save_state(&self, state: &ProcessingState) -> StoreResult<()>;

    /// Drop all persisted state.
    async fn clear(&self) -> StoreResult<()>;
}

/// Repository storing pairs and unpaired videos under separate keys.
#[derive(Clone)]
pub struct KvStateRepository {
    store: Arc<dyn KeyValueStore>,
}

impl KvStateRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn read<T: DeserializeOwned + Default>(&self, key: &str) -> StoreResult<T> {
        match self.store.get(key).await? {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::corrupt(key, e.to_string())),
        }
    }

    fn entry<T: Serialize>(key: &str, value: &T) -> StoreResult<(String, serde_json::Value)> {
        Ok((key.to_string(), serde_json::to_value(value)?))
    }
}

#[async_trait]
impl StateRepository for KvStateRepository {
    async fn load_state(&self) -> StoreResult<ProcessingState> {
        let pairs = self.read(PAIRS_KEY).await?;
        let unpaired_videos = self.read(UNPAIRED_VIDEOS_KEY).await?;
        let mut state = ProcessingState::new(pairs, unpaired_videos);
        let dropped = state.repair();
        if !dropped.is_empty() {
            warn!(count = dropped.len(), videos = ?dropped, "Dropped duplicate video records from stored state");
        }
        Ok(state)
    }

    async fn save_state(&self, state: &ProcessingState) -> StoreResult<()> {
        // Both keys land together so no video is ever stored twice
        self.store
            .set_many(vec![
                Self::entry(PAIRS_KEY, &state.pairs)?,
                Self::entry(UNPAIRED_VIDEOS_KEY, &state.unpaired_videos)?,
            ])
            .await?;
        debug!(
            pairs = state.pairs.len(),
            unpaired = state.unpaired_videos.len(),
            "Processing state saved"
        );
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.store.clear().await
    }
}
