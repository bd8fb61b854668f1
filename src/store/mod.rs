// Durable settings storage
//
// The engine keeps all of its durable state in a flat key/value store of
// JSON values, mirroring a browser extension's local storage area:
// - Memory: in-process map, for embedding and tests
// - File: a single JSON object on disk, rewritten atomically on every write
//
// Every write is published on a broadcast feed so that an engine can pick up
// changes made by another writer (for example the CLI importing settings).

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;

/// Capacity of the change feed before slow subscribers start lagging
pub(crate) const CHANGE_FEED_CAPACITY: usize = 64;

/// A single key written to or removed from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    /// New value, or `None` when the key was removed
    pub new_value: Option<Value>,
}

/// Main trait for durable key/value settings storage
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write several keys as one durable operation
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Remove keys; missing keys are ignored
    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// List every key currently stored
    async fn keys(&self) -> Result<Vec<String>>;

    /// Subscribe to the change feed
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    /// Write a single key
    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_many(vec![(key.to_string(), value)]).await
    }
}

/// Read a key and deserialize it into `T`
pub async fn get_as<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize `value` and write it under `key`
pub async fn set_as<T: Serialize + ?Sized>(store: &dyn SettingsStore, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_value(value)?).await
}

pub(crate) fn publish(sender: &broadcast::Sender<StoreChange>, changes: Vec<StoreChange>) {
    for change in changes {
        // No subscribers is not an error
        let _ = sender.send(change);
    }
}
