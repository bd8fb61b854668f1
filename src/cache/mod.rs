// Named translation caches
//
// One `CacheStore` exists per cache name: the shared default cache plus one per
// override configured with a dedicated cache. Stores are created lazily by the
// registry on first use, hydrated from the settings store on `load`, and drop
// their entries from memory once every request has released them and any
// pending flush has landed.

pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

pub use store::{CacheEntry, CacheStore};

use crate::error::{Result, TranspassError};
use crate::settings::CACHE_PREFIX;
use crate::store::SettingsStore;

/// Registry of named caches sharing one settings store
pub struct CacheRegistry {
    caches: Mutex<HashMap<String, Arc<CacheStore>>>,
    store: Arc<dyn SettingsStore>,
    quiet_window: Duration,
}

impl CacheRegistry {
    pub fn new(store: Arc<dyn SettingsStore>, quiet_window: Duration) -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
            store,
            quiet_window,
        }
    }

    fn caches(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheStore>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference on the named cache, creating it if needed
    ///
    /// Every acquire must be paired with a `CacheStore::release`.
    pub fn acquire(&self, name: &str, capacity: usize) -> Arc<CacheStore> {
        let cache = Arc::clone(self.caches().entry(name.to_string()).or_insert_with(|| {
            debug!("Created cache {} (capacity {})", name, capacity);
            CacheStore::new(name, capacity, Arc::clone(&self.store), self.quiet_window)
        }));
        cache.set_capacity(capacity);
        cache.retain_reference();
        cache
    }

    /// Look up a cache without taking a reference
    pub fn get(&self, name: &str) -> Option<Arc<CacheStore>> {
        self.caches().get(name).cloned()
    }

    /// Names of every cache persisted in the settings store
    pub async fn stored_names(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(CACHE_PREFIX))
            .collect())
    }

    /// Empty a cache in memory and durably
    pub async fn clear(&self, name: &str) -> Result<()> {
        let cache = self.acquire(name, self.get(name).map_or(0, |c| c.capacity()));
        let cleared = cache.clear().await;
        let released = cache.release();
        cleared?;
        released?;
        info!("Flushed cache {}", name);
        Ok(())
    }

    /// Shrink a cache to `capacity`, creating an empty sequence if none is stored
    pub async fn truncate(&self, name: &str, capacity: usize) -> Result<usize> {
        let cache = self.acquire(name, capacity);
        let pruned = async {
            cache.load().await?;
            let removed = cache.prune()?;
            if removed == 0 && self.store.get(name).await?.is_none() {
                cache.schedule_persist();
            }
            Ok::<usize, TranspassError>(removed)
        }
        .await;
        let released = cache.release();
        let removed = pruned?;
        released?;
        Ok(removed)
    }

    /// Delete caches from memory and from the settings store
    pub async fn delete(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let removed: Vec<Arc<CacheStore>> = {
            let mut caches = self.caches();
            names.iter().filter_map(|name| caches.remove(name)).collect()
        };
        // Land pending writes first so they cannot resurrect a deleted key
        for cache in removed {
            cache.flush_now().await?;
        }
        self.store.remove(names).await?;
        info!("Deleted caches: {}", names.join(", "));
        Ok(())
    }

    /// Write every cache with a pending flush immediately
    pub async fn flush_all(&self) -> Result<()> {
        let caches: Vec<Arc<CacheStore>> = self.caches().values().cloned().collect();
        for cache in caches {
            cache.flush_now().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reuses_named_store() {
        let registry = CacheRegistry::new(Arc::new(MemoryStore::new()), WINDOW);
        let first = registry.acquire("cache-default", 10);
        let second = registry.acquire("cache-default", 20);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.capacity(), 20);
        assert_eq!(second.references(), 2);

        first.release().unwrap();
        second.release().unwrap();
        assert_eq!(first.references(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_caches_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let registry = CacheRegistry::new(store.clone(), WINDOW);

        let shared = registry.acquire("cache-default", 10);
        let site = registry.acquire("cache-site", 10);
        shared.load().await.unwrap();
        site.load().await.unwrap();
        site.set("a", "fr", "A").unwrap();

        assert_eq!(shared.get("a", "fr").unwrap(), None);
        registry.flush_all().await.unwrap();
        assert!(store.get("cache-site").await.unwrap().is_some());
        assert_eq!(store.get("cache-default").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncate_and_delete() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "cache-site",
                json!([
                    {"input": "a", "target": "fr", "output": "A"},
                    {"input": "b", "target": "fr", "output": "B"},
                    {"input": "c", "target": "fr", "output": "C"}
                ]),
            )
            .await
            .unwrap();
        let registry = CacheRegistry::new(store.clone(), WINDOW);

        assert_eq!(registry.truncate("cache-site", 1).await.unwrap(), 2);
        assert_eq!(registry.truncate("cache-new", 5).await.unwrap(), 0);
        registry.flush_all().await.unwrap();
        assert_eq!(
            store.get("cache-site").await.unwrap(),
            Some(json!([{"input": "a", "target": "fr", "output": "A"}]))
        );
        assert_eq!(store.get("cache-new").await.unwrap(), Some(json!([])));

        let mut names = registry.stored_names().await.unwrap();
        names.sort();
        assert_eq!(names, ["cache-new", "cache-site"]);

        registry.delete(&["cache-site".to_string()]).await.unwrap();
        assert!(registry.get("cache-site").is_none());
        assert_eq!(store.get("cache-site").await.unwrap(), None);
    }
}
