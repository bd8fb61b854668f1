// Shared helpers for integration tests
//
// Provides a scripted provider factory that records every chunk it is asked
// to translate, a settings store whose writes can be made to fail, and
// builders for engines seeded with settings and quota records.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tokio::sync::broadcast;

use transpass::batch::ChunkLimits;
use transpass::engine::{Engine, EngineOptions};
use transpass::error::{Result, TranspassError};
use transpass::provider::{ProviderFactory, TranslationProvider};
use transpass::quota::{QuotaLedger, QuotaRecord};
use transpass::settings::{ProviderConfig, Service, Settings, KEY_QUOTAS};
use transpass::store::{MemoryStore, SettingsStore, StoreChange};

pub const PERSIST_DELAY: Duration = Duration::from_millis(200);

/// Fixed day used as "today" by every test ledger
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
}

/// One chunk sent to a fake provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub provider: String,
    pub target: String,
    pub inputs: Vec<String>,
}

/// How a fake provider answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Answers `"{target}:{input}"` for every input
    Echo,
    /// Fails every call
    Fail(String),
    /// Echoes, except that the nth call (1-based) to this provider fails
    FailOnCall(usize),
}

#[derive(Default)]
struct FactoryState {
    calls: Vec<Call>,
    behaviors: HashMap<String, Behavior>,
}

/// Provider factory that never touches the network
#[derive(Clone)]
pub struct FakeFactory {
    state: Arc<Mutex<FactoryState>>,
    limits: ChunkLimits,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::with_limits(ChunkLimits { max_items: 100, max_characters: 10_000 })
    }

    pub fn with_limits(limits: ChunkLimits) -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState::default())),
            limits,
        }
    }

    pub fn behave(&self, provider: &str, behavior: Behavior) {
        self.state.lock().unwrap().behaviors.insert(provider.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, provider: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|call| call.provider == provider).collect()
    }
}

impl ProviderFactory for FakeFactory {
    fn create(&self, config: &ProviderConfig) -> Box<dyn TranslationProvider> {
        Box::new(FakeProvider {
            id: config.quota_key.clone(),
            state: Arc::clone(&self.state),
            limits: self.limits,
        })
    }
}

struct FakeProvider {
    id: String,
    state: Arc<Mutex<FactoryState>>,
    limits: ChunkLimits,
}

#[async_trait]
impl TranslationProvider for FakeProvider {
    fn limits(&self) -> ChunkLimits {
        self.limits
    }

    async fn translate_chunk(&self, target: &str, inputs: &[&str]) -> Result<Vec<String>> {
        let (behavior, call_number) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call {
                provider: self.id.clone(),
                target: target.to_string(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
            });
            let call_number = state.calls.iter().filter(|call| call.provider == self.id).count();
            (state.behaviors.get(&self.id).cloned().unwrap_or(Behavior::Echo), call_number)
        };

        match behavior {
            Behavior::Fail(message) => Err(TranspassError::Provider(message)),
            Behavior::FailOnCall(n) if n == call_number => {
                Err(TranspassError::Provider(format!("call {} failed", n)))
            }
            _ => Ok(inputs.iter().map(|input| format!("{}:{}", target, input)).collect()),
        }
    }
}

/// Memory store whose writes can be made to fail, all of them or by key prefix
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    failing_prefix: Mutex<Option<String>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_writes: AtomicBool::new(false),
            failing_prefix: Mutex::new(None),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes_to(&self, prefix: &str) {
        *self.failing_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    fn rejects(&self, entries: &[(String, Value)]) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return true;
        }
        match self.failing_prefix.lock().unwrap().as_deref() {
            Some(prefix) => entries.iter().any(|(key, _)| key.starts_with(prefix)),
            None => false,
        }
    }
}

#[async_trait]
impl SettingsStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        if self.rejects(&entries) {
            return Err(TranspassError::Storage("disk full".to_string()));
        }
        self.inner.set_many(entries).await
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        self.inner.remove(keys).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.subscribe()
    }
}

/// Enabled provider with a fixed quota key and stop threshold
pub fn provider(service: Service, quota_key: &str, stop_after: u64) -> ProviderConfig {
    let mut provider = ProviderConfig::new(service, "test-key");
    provider.quota_key = quota_key.to_string();
    provider.warn_after = 0;
    provider.stop_after = stop_after;
    provider
}

pub fn settings_with(providers: Vec<ProviderConfig>) -> Settings {
    Settings {
        target: "fr".to_string(),
        providers,
        ..Settings::default()
    }
}

/// Record for the test month
pub fn used(characters: u64) -> QuotaRecord {
    QuotaRecord { month: 2, characters }
}

/// Seed `store` with `settings` and `quotas`, then open an engine on it
pub async fn open_engine(
    store: Arc<dyn SettingsStore>,
    settings: &Settings,
    quotas: BTreeMap<String, QuotaRecord>,
    factory: &FakeFactory,
) -> Arc<Engine> {
    let mut entries = settings.to_entries().unwrap();
    entries.push((KEY_QUOTAS.to_string(), serde_json::to_value(&quotas).unwrap()));
    store.set_many(entries).await.unwrap();

    let ledger = QuotaLedger::load_with_clock(Arc::clone(&store), Box::new(today)).await.unwrap();
    Engine::with_ledger(
        store,
        Arc::new(factory.clone()),
        Arc::new(ledger),
        EngineOptions { persist_delay: PERSIST_DELAY },
    )
    .await
    .unwrap()
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
