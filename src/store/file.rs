use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info};

use super::{publish, SettingsStore, StoreChange, CHANGE_FEED_CAPACITY};
use crate::error::{Result, TranspassError};

/// Settings store backed by a single JSON object file
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
    // Serializes file rewrites so a slower write never lands after a newer one
    write_lock: AsyncMutex<()>,
    changes: broadcast::Sender<StoreChange>,
}

impl FileStore {
    /// Open the store, reading the file if it exists
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let values = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                TranspassError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Settings file {} not found, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            path,
            values: Mutex::new(values),
            write_lock: AsyncMutex::new(()),
            changes,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.values
            .lock()
            .map_err(|_| TranspassError::Storage("file store lock poisoned".to_string()))
    }

    /// Apply `update` to the in-memory map and rewrite the file
    async fn commit<F>(&self, update: F) -> Result<Vec<StoreChange>>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> Vec<StoreChange>,
    {
        let _guard = self.write_lock.lock().await;

        let mut updated = self.lock()?.clone();
        let changes = update(&mut updated);
        let content = serde_json::to_string_pretty(&updated)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await.map_err(|e| {
            TranspassError::Storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            TranspassError::Storage(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        *self.lock()? = updated;

        debug!("Wrote settings file {} ({} keys changed)", self.path.display(), changes.len());
        Ok(changes)
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let changes = self
            .commit(|values| {
                entries
                    .into_iter()
                    .map(|(key, value)| {
                        values.insert(key.clone(), value.clone());
                        StoreChange { key, new_value: Some(value) }
                    })
                    .collect()
            })
            .await?;
        publish(&self.changes, changes);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let changes = self
            .commit(|values| {
                keys.iter()
                    .filter(|key| values.remove(key.as_str()).is_some())
                    .map(|key| StoreChange { key: key.clone(), new_value: None })
                    .collect()
            })
            .await?;
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
