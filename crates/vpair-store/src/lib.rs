//! State persistence for the VPair engine.
//!
//! This crate provides:
//! - A `KeyValueStore` trait with in-memory and JSON-file backends
//! - The `StateRepository` that loads and saves the processing state

pub mod error;
pub mod kv;
pub mod repository;

pub use error::{StoreError, StoreResult};
#[cfg(any(test, feature = "mock"))]
pub use kv::MockKeyValueStore;
pub use kv::{JsonFileStore, KeyValueStore, MemoryStore};
pub use repository::{KvStateRepository, StateRepository, PAIRS_KEY, UNPAIRED_VIDEOS_KEY};
