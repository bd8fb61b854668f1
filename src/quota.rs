//! Per-provider monthly character accounting.
//!
//! Each provider owns one [`QuotaRecord`] keyed by its `quota_key`. Records
//! only grow within a month and are zeroed once per month, on the first check
//! that falls on or after the provider's `reset_on` day in a new month.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::settings::{ProviderConfig, KEY_QUOTAS};
use crate::store::{self, SettingsStore, CHANGE_FEED_CAPACITY};

/// Characters consumed by one provider in the current billing month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Zero-based calendar month the counter belongs to
    pub month: u32,
    pub characters: u64,
}

/// Outcome of a budget check before spending characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Ok { current: u64, requested: u64 },
    Exceeded { current: u64, requested: u64, limit: u64 },
}

/// Usage level of a provider relative to its thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    Normal,
    Warning,
    Stopped,
}

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

type Records = BTreeMap<String, QuotaRecord>;

pub struct QuotaLedger {
    records: Mutex<Records>,
    /// Snapshots this ledger wrote whose change-feed echo has not been seen, oldest first
    written: Mutex<VecDeque<Records>>,
    store: Arc<dyn SettingsStore>,
    clock: Clock,
}

impl QuotaLedger {
    /// Load quota records from the store
    pub async fn load(store: Arc<dyn SettingsStore>) -> Result<Self> {
        Self::load_with_clock(store, Box::new(|| Local::now().date_naive())).await
    }

    pub async fn load_with_clock(store: Arc<dyn SettingsStore>, clock: Clock) -> Result<Self> {
        let records: BTreeMap<String, QuotaRecord> =
            store::get_as(store.as_ref(), KEY_QUOTAS).await?.unwrap_or_default();
        debug!("Loaded {} quota records", records.len());
        Ok(Self {
            records: Mutex::new(records),
            written: Mutex::new(VecDeque::new()),
            store,
            clock,
        })
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, QuotaRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn written(&self) -> MutexGuard<'_, VecDeque<Records>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.records().clone();
        {
            let mut written = self.written();
            if written.len() >= CHANGE_FEED_CAPACITY {
                written.pop_front();
            }
            written.push_back(snapshot.clone());
        }

        let result = store::set_as(self.store.as_ref(), KEY_QUOTAS, &snapshot).await;
        if result.is_err() {
            let mut written = self.written();
            if let Some(position) = written.iter().rposition(|w| *w == snapshot) {
                written.remove(position);
            }
        }
        result
    }

    /// Match a quotas change from the store feed against this ledger's own writes
    ///
    /// Returns true, and forgets that write and every older one, when `records`
    /// is one of them. Anything else was written by another party.
    pub fn acknowledge_echo(&self, records: &Records) -> bool {
        let mut written = self.written();
        match written.iter().position(|w| w == records) {
            Some(position) => {
                written.drain(..=position);
                true
            }
            None => false,
        }
    }

    pub fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    pub fn record(&self, quota_key: &str) -> Option<QuotaRecord> {
        self.records().get(quota_key).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, QuotaRecord> {
        self.records().clone()
    }

    /// Replace in-memory records with values written by another party
    pub fn replace(&self, records: BTreeMap<String, QuotaRecord>) {
        *self.records() = records;
    }

    /// Check whether `additional` characters fit in the provider's budget
    pub fn check_budget(&self, provider: &ProviderConfig, additional: u64) -> BudgetCheck {
        let current = self.record(&provider.quota_key).map_or(0, |r| r.characters);
        if provider.stop_after > 0 && current.saturating_add(additional) > provider.stop_after {
            BudgetCheck::Exceeded {
                current,
                requested: additional,
                limit: provider.stop_after,
            }
        } else {
            BudgetCheck::Ok { current, requested: additional }
        }
    }

    /// Add consumed characters and persist before returning
    pub async fn consume(&self, provider: &ProviderConfig, characters: u64) -> Result<QuotaRecord> {
        let month = self.today().month0();
        let (record, changed) = {
            let mut records = self.records();
            let mut changed = false;
            let record = records.entry(provider.quota_key.clone()).or_insert_with(|| {
                changed = true;
                QuotaRecord { month, characters: 0 }
            });
            if characters > 0 {
                record.characters = record.characters.saturating_add(characters);
                changed = true;
            }
            (*record, changed)
        };

        if changed {
            self.persist().await?;
            debug!("Quota {} now at {} characters", provider.quota_key, record.characters);
        }
        Ok(record)
    }

    /// Zero records whose provider reached its reset day in a new month
    ///
    /// Returns true if any record changed.
    pub async fn reset_if_due(&self, providers: &[ProviderConfig], now: NaiveDate) -> Result<bool> {
        let month = now.month0();
        let day = now.day();

        let any_reset = {
            let mut records = self.records();
            let mut any_reset = false;
            for provider in providers {
                if let Some(record) = records.get_mut(&provider.quota_key) {
                    if record.month != month && day >= provider.reset_on {
                        info!("Reset quota for {} ({} characters used last cycle)",
                              provider.quota_key, record.characters);
                        record.month = month;
                        record.characters = 0;
                        any_reset = true;
                    }
                }
            }
            any_reset
        };

        if any_reset {
            self.persist().await?;
        }
        Ok(any_reset)
    }

    /// Overwrite a provider's counter for the current month
    pub async fn set_characters(&self, quota_key: &str, characters: u64) -> Result<QuotaRecord> {
        let record = QuotaRecord { month: self.today().month0(), characters };
        self.records().insert(quota_key.to_string(), record);
        self.persist().await?;
        info!("Quota {} set to {} characters", quota_key, characters);
        Ok(record)
    }

    /// Drop records whose key is not in `valid_keys`, returning how many were removed
    pub async fn retain(&self, valid_keys: &[&str]) -> Result<usize> {
        let removed = {
            let mut records = self.records();
            let before = records.len();
            records.retain(|key, _| valid_keys.contains(&key.as_str()));
            before - records.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub fn status(&self, provider: &ProviderConfig) -> QuotaStatus {
        let characters = self.record(&provider.quota_key).map_or(0, |r| r.characters);
        if provider.stop_after > 0 && characters >= provider.stop_after {
            QuotaStatus::Stopped
        } else if provider.warn_after > 0 && characters > provider.warn_after {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Service;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn provider(key: &str, stop_after: u64, reset_on: u32) -> ProviderConfig {
        let mut provider = ProviderConfig::new(Service::Azure, "k");
        provider.quota_key = key.to_string();
        provider.stop_after = stop_after;
        provider.warn_after = 0;
        provider.reset_on = reset_on;
        provider
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn ledger_on(store: Arc<MemoryStore>, today: NaiveDate) -> QuotaLedger {
        QuotaLedger::load_with_clock(store, Box::new(move || today)).await.unwrap()
    }

    #[tokio::test]
    async fn test_consume_creates_and_persists_record() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store.clone(), date(2024, 3, 10)).await;
        let azure = provider("qa", 0, 1);

        let record = ledger.consume(&azure, 12).await.unwrap();
        assert_eq!(record, QuotaRecord { month: 2, characters: 12 });

        let record = ledger.consume(&azure, 5).await.unwrap();
        assert_eq!(record.characters, 17);
        assert_eq!(
            store.get(KEY_QUOTAS).await.unwrap(),
            Some(json!({"qa": {"month": 2, "characters": 17}}))
        );
    }

    #[tokio::test]
    async fn test_check_budget_respects_stop_after() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store, date(2024, 3, 10)).await;
        let limited = provider("qa", 10, 1);
        let unlimited = provider("qb", 0, 1);

        ledger.consume(&limited, 8).await.unwrap();
        assert!(matches!(ledger.check_budget(&limited, 2), BudgetCheck::Ok { current: 8, .. }));
        assert_eq!(
            ledger.check_budget(&limited, 5),
            BudgetCheck::Exceeded { current: 8, requested: 5, limit: 10 }
        );
        assert!(matches!(ledger.check_budget(&unlimited, u64::MAX), BudgetCheck::Ok { .. }));
    }

    #[tokio::test]
    async fn test_reset_happens_once_per_month_on_reset_day() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store, date(2024, 3, 10)).await;
        let billing = provider("qa", 0, 15);
        ledger.consume(&billing, 100).await.unwrap();

        // Same month: nothing to do
        assert!(!ledger.reset_if_due(&[billing.clone()], date(2024, 3, 31)).await.unwrap());
        // New month, before the reset day
        assert!(!ledger.reset_if_due(&[billing.clone()], date(2024, 4, 14)).await.unwrap());
        assert_eq!(ledger.record("qa").unwrap().characters, 100);

        assert!(ledger.reset_if_due(&[billing.clone()], date(2024, 4, 15)).await.unwrap());
        assert_eq!(ledger.record("qa").unwrap(), QuotaRecord { month: 3, characters: 0 });

        ledger.consume(&billing, 7).await.unwrap();
        assert!(!ledger.reset_if_due(&[billing.clone()], date(2024, 4, 20)).await.unwrap());
        assert_eq!(ledger.record("qa").unwrap().characters, 7);
    }

    #[tokio::test]
    async fn test_reset_skips_providers_without_records() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store.clone(), date(2024, 3, 10)).await;
        assert!(!ledger.reset_if_due(&[provider("none", 0, 1)], date(2024, 5, 1)).await.unwrap());
        assert_eq!(store.get(KEY_QUOTAS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_thresholds() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store, date(2024, 3, 10)).await;
        let mut watched = provider("qa", 100, 1);
        watched.warn_after = 50;

        assert_eq!(ledger.status(&watched), QuotaStatus::Normal);
        ledger.consume(&watched, 50).await.unwrap();
        assert_eq!(ledger.status(&watched), QuotaStatus::Normal);
        ledger.consume(&watched, 1).await.unwrap();
        assert_eq!(ledger.status(&watched), QuotaStatus::Warning);
        ledger.consume(&watched, 49).await.unwrap();
        assert_eq!(ledger.status(&watched), QuotaStatus::Stopped);
    }

    #[tokio::test]
    async fn test_set_characters_and_retain() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store.clone(), date(2024, 7, 1)).await;
        ledger.set_characters("keep", 40).await.unwrap();
        ledger.set_characters("drop", 3).await.unwrap();

        assert_eq!(ledger.retain(&["keep"]).await.unwrap(), 1);
        assert_eq!(ledger.retain(&["keep"]).await.unwrap(), 0);
        assert_eq!(
            store.get(KEY_QUOTAS).await.unwrap(),
            Some(json!({"keep": {"month": 6, "characters": 40}}))
        );
    }

    #[tokio::test]
    async fn test_acknowledge_echo_matches_own_writes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger_on(store, date(2024, 3, 10)).await;
        let azure = provider("qa", 0, 1);

        ledger.consume(&azure, 10).await.unwrap();
        let first = ledger.snapshot();
        ledger.consume(&azure, 10).await.unwrap();
        let second = ledger.snapshot();

        let foreign = BTreeMap::from([("qa".to_string(), QuotaRecord { month: 2, characters: 3 })]);
        assert!(!ledger.acknowledge_echo(&foreign));

        assert!(ledger.acknowledge_echo(&first));
        assert!(ledger.acknowledge_echo(&second));
        // Each write is echoed once
        assert!(!ledger.acknowledge_echo(&first));
        assert_eq!(ledger.record("qa").unwrap().characters, 20);
    }
}
