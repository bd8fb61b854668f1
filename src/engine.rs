use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheRegistry;
use crate::error::Result;
use crate::provider::ProviderFactory;
use crate::quota::{QuotaLedger, QuotaRecord, QuotaStatus};
use crate::router::{ProviderRouter, RouteRequest, TranslateResponse};
use crate::settings::{
    Override, ProviderConfig, Service, Settings, DEFAULT_CACHE_NAME, KEY_CACHE_SIZE, KEY_OVERRIDES, KEY_PROVIDERS,
    KEY_QUOTAS, KEY_TARGET,
};
use crate::store::{SettingsStore, StoreChange};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Quiet window before dirty caches are written back
    pub persist_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            persist_delay: Duration::from_secs(5),
        }
    }
}

/// A caller's translation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    /// Target language; the configured default when absent
    pub target: Option<String>,
    pub inputs: Vec<String>,
    /// Page the inputs came from, used to pick an override
    pub url: Option<String>,
    /// Explicit user action rather than automatic page translation
    #[serde(default)]
    pub manual: bool,
}

/// Usage summary for one configured provider
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub id: String,
    pub service: Service,
    pub enabled: bool,
    pub characters: u64,
    pub warn_after: u64,
    pub stop_after: u64,
    pub reset_on: u32,
    pub status: QuotaStatus,
}

/// Translation engine bound to one settings store
pub struct Engine {
    store: Arc<dyn SettingsStore>,
    settings: RwLock<Settings>,
    ledger: Arc<QuotaLedger>,
    caches: Arc<CacheRegistry>,
    router: ProviderRouter,
}

impl Engine {
    /// Load settings and quotas, and apply any quota reset that is due
    pub async fn open(
        store: Arc<dyn SettingsStore>,
        factory: Arc<dyn ProviderFactory>,
        options: EngineOptions,
    ) -> Result<Arc<Self>> {
        let ledger = Arc::new(QuotaLedger::load(Arc::clone(&store)).await?);
        Self::with_ledger(store, factory, ledger, options).await
    }

    /// Open with an already loaded ledger
    pub async fn with_ledger(
        store: Arc<dyn SettingsStore>,
        factory: Arc<dyn ProviderFactory>,
        ledger: Arc<QuotaLedger>,
        options: EngineOptions,
    ) -> Result<Arc<Self>> {
        let settings = Settings::load(store.as_ref()).await?;
        ledger.reset_if_due(&settings.providers, ledger.today()).await?;

        let caches = Arc::new(CacheRegistry::new(Arc::clone(&store), options.persist_delay));
        let router = ProviderRouter::new(Arc::clone(&caches), Arc::clone(&ledger), factory);

        info!("Engine ready: target {}, {} providers, {} overrides",
              settings.target, settings.providers.len(), settings.overrides.len());

        Ok(Arc::new(Self {
            store,
            settings: RwLock::new(settings),
            ledger,
            caches,
            router,
        }))
    }

    fn read_settings(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_settings(&self, update: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut *settings);
    }

    pub fn settings(&self) -> Settings {
        self.read_settings().clone()
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// First override matching `url`
    pub fn find_override(&self, url: &str) -> Option<Override> {
        self.read_settings().find_override(url).cloned()
    }

    pub async fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        let settings = self.settings();
        self.ledger.reset_if_due(&settings.providers, self.ledger.today()).await?;

        let target = request
            .target
            .as_deref()
            .filter(|target| !target.trim().is_empty())
            .unwrap_or(&settings.target);
        let rule = request.url.as_deref().and_then(|url| settings.find_override(url));
        let selector = settings.cache_selector(rule);

        debug!("Translating {} inputs to {} using {}", request.inputs.len(), target, selector.name);
        let response = self
            .router
            .translate(RouteRequest {
                target,
                inputs: &request.inputs,
                cache: &selector,
                providers: &settings.providers,
                manual: request.manual,
            })
            .await?;

        if let Some(error) = &response.error {
            warn!("Translation to {} incomplete: {}", target, error);
        }
        Ok(response)
    }

    /// Empty the default cache or a named one
    pub async fn flush_cache(&self, name: Option<&str>) -> Result<()> {
        self.caches.clear(name.unwrap_or(DEFAULT_CACHE_NAME)).await
    }

    /// Manually correct a provider's usage for the current month
    pub async fn set_quota(&self, quota_key: &str, characters: u64) -> Result<QuotaRecord> {
        self.ledger.set_characters(quota_key, characters).await
    }

    pub fn quota_report(&self) -> Vec<QuotaReport> {
        self.read_settings()
            .providers
            .iter()
            .map(|provider| QuotaReport {
                id: provider.id().to_string(),
                service: provider.service,
                enabled: provider.enabled,
                characters: self.ledger.record(&provider.quota_key).map_or(0, |r| r.characters),
                warn_after: provider.warn_after,
                stop_after: provider.stop_after,
                reset_on: provider.reset_on,
                status: self.ledger.status(provider),
            })
            .collect()
    }

    /// Persist new settings and bring quotas and caches in line with them
    pub async fn save_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;

        let quota_keys: Vec<&str> = settings.providers.iter().map(|p| p.quota_key.as_str()).collect();
        let dropped = self.ledger.retain(&quota_keys).await?;
        if dropped > 0 {
            info!("Dropped {} quota records of removed providers", dropped);
        }

        let dedicated: Vec<&Override> = settings.overrides.iter().filter(|o| o.dedicated_cache).collect();
        let orphaned: Vec<String> = self
            .caches
            .stored_names()
            .await?
            .into_iter()
            .filter(|name| name != DEFAULT_CACHE_NAME)
            .filter(|name| !dedicated.iter().any(|o| &o.dedicated_cache_name == name))
            .collect();
        self.caches.delete(&orphaned).await?;

        self.caches.truncate(DEFAULT_CACHE_NAME, settings.cache_size).await?;
        for rule in &dedicated {
            self.caches.truncate(&rule.dedicated_cache_name, rule.dedicated_cache_size).await?;
        }

        self.store.set_many(settings.to_entries()?).await?;
        self.update_settings(|current| *current = settings);
        info!("Settings saved");
        Ok(())
    }

    /// Apply one externally written key to the in-memory state
    pub fn apply_change(&self, change: &StoreChange) -> Result<()> {
        let value = change.new_value.clone();
        match change.key.as_str() {
            KEY_TARGET => {
                let target = match value {
                    Some(value) => serde_json::from_value(value)?,
                    None => Settings::default().target,
                };
                self.update_settings(|s| s.target = target);
            }
            KEY_CACHE_SIZE => {
                let cache_size = match value {
                    Some(value) => serde_json::from_value(value)?,
                    None => Settings::default().cache_size,
                };
                self.update_settings(|s| s.cache_size = cache_size);
            }
            KEY_OVERRIDES => {
                let overrides: Vec<Override> = value.map(serde_json::from_value).transpose()?.unwrap_or_default();
                self.update_settings(|s| s.overrides = overrides);
            }
            KEY_PROVIDERS => {
                let providers: Vec<ProviderConfig> = value.map(serde_json::from_value).transpose()?.unwrap_or_default();
                self.update_settings(|s| s.providers = providers);
            }
            KEY_QUOTAS => {
                let records: BTreeMap<String, QuotaRecord> = value.map(serde_json::from_value).transpose()?.unwrap_or_default();
                if self.ledger.acknowledge_echo(&records) {
                    debug!("Skipped echo of own quota write");
                    return Ok(());
                }
                if records != self.ledger.snapshot() {
                    self.ledger.replace(records);
                }
            }
            _ => return Ok(()),
        }
        debug!("Applied external change to {}", change.key);
        Ok(())
    }

    /// Re-read every settings key and the quota records
    pub async fn reload(&self) -> Result<()> {
        let settings = Settings::load(self.store.as_ref()).await?;
        let records: BTreeMap<String, QuotaRecord> = crate::store::get_as(self.store.as_ref(), KEY_QUOTAS).await?.unwrap_or_default();
        self.update_settings(|current| *current = settings);
        self.ledger.replace(records);
        Ok(())
    }

    /// Follow the store's change feed until the engine is dropped
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let engine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let received = changes.recv().await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let applied = match received {
                    Ok(change) => engine.apply_change(&change),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} settings changes, reloading", missed);
                        engine.reload().await
                    }
                    Err(RecvError::Closed) => return,
                };
                if let Err(e) = applied {
                    warn!("Failed to apply settings change: {}", e);
                }
            }
        })
    }

    /// Write every pending cache flush immediately
    pub async fn shutdown(&self) -> Result<()> {
        self.caches.flush_all().await
    }
}
