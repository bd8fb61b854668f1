use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{publish, SettingsStore, StoreChange, CHANGE_FEED_CAPACITY};
use crate::error::{Result, TranspassError};

/// In-process settings store
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_values(BTreeMap::new())
    }

    pub fn with_values(values: BTreeMap<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            values: Mutex::new(values),
            changes,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.values
            .lock()
            .map_err(|_| TranspassError::Storage("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let changes = {
            let mut values = self.lock()?;
            entries
                .into_iter()
                .map(|(key, value)| {
                    values.insert(key.clone(), value.clone());
                    StoreChange { key, new_value: Some(value) }
                })
                .collect()
        };
        publish(&self.changes, changes);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let changes = {
            let mut values = self.lock()?;
            keys.iter()
                .filter(|key| values.remove(key.as_str()).is_some())
                .map(|key| StoreChange { key: key.clone(), new_value: None })
                .collect()
        };
        publish(&self.changes, changes);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_remove() {
        let store = MemoryStore::new();
        store.set("target", json!("ja")).await.unwrap();
        assert_eq!(store.get("target").await.unwrap(), Some(json!("ja")));

        store.remove(&["target".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(store.get("target").await.unwrap(), None);
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_are_published() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe();

        store
            .set_many(vec![
                ("target".to_string(), json!("fr")),
                ("cacheSize".to_string(), json!(10)),
            ])
            .await
            .unwrap();
        store.remove(&["target".to_string()]).await.unwrap();

        let first = feed.recv().await.unwrap();
        assert_eq!(first, StoreChange { key: "target".to_string(), new_value: Some(json!("fr")) });
        let second = feed.recv().await.unwrap();
        assert_eq!(second.key, "cacheSize");
        let third = feed.recv().await.unwrap();
        assert_eq!(third, StoreChange { key: "target".to_string(), new_value: None });
    }
}
