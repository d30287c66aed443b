//! Key-value store abstraction with in-memory and JSON-file backends.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Minimal get/set/clear store holding JSON values.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key. Missing keys are `None`, not an error.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Write a key.
    async fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Write several keys at once. Either every entry lands or none does.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()>;

    /// Remove every key.
    async fn clear(&self) -> StoreResult<()>;
}

/// Volatile store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        self.values.lock().await.extend(entries);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.values.lock().await.clear();
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk.
///
/// Every write rewrites the whole document through a temp file and a rename,
/// so a crash leaves either the old or the new document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> StoreResult<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(StoreError::unavailable(format!("{}: {}", self.path.display(), e))),
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::corrupt(
                self.path.display().to_string(),
                format!("expected a JSON object, found {}", type_name(&other)),
            )),
        }
    }

    async fn write_document(&self, document: &Map<String, Value>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), "Failed to replace state file: {}", e);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), keys = document.len(), "State file written");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_document().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        document.insert(key.to_string(), value);
        self.write_document(&document)
            .await
            .map_err(|e| StoreError::write_failed(key, e.to_string()))
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        document.extend(entries);
        self.write_document(&document)
            .await
            .map_err(|e| StoreError::write_failed(keys.join(","), e.to_string()))
    }

    async fn clear(&self) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        self.write_document(&Map::new()).await
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
