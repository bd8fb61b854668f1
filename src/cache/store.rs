use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::{Result, TranspassError};
use crate::store::{self, SettingsStore};

/// A cached translation; identity is the exact (input, target) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub input: String,
    pub target: String,
    pub output: String,
}

/// Persistence progress of a store's in-memory entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Clean,
    DirtyPending { deadline: Instant },
    /// A write is in flight; `follow_up` is set when entries changed meanwhile
    Flushing { follow_up: bool },
}

struct CacheState {
    /// Most recently used first; `None` while unloaded
    entries: Option<VecDeque<CacheEntry>>,
    capacity: usize,
    flush: FlushState,
    references: usize,
    flush_error: Option<String>,
}

/// LRU-ordered, size-bounded translation cache with debounced persistence
pub struct CacheStore {
    name: String,
    state: Mutex<CacheState>,
    store: Arc<dyn SettingsStore>,
    quiet_window: Duration,
    flushed: Notify,
}

impl CacheStore {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        store: Arc<dyn SettingsStore>,
        quiet_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(CacheState {
                entries: None,
                capacity,
                flush: FlushState::Clean,
                references: 0,
                flush_error: None,
            }),
            store,
            quiet_window,
            flushed: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_loaded(&self) -> TranspassError {
        TranspassError::Cache(format!("cache '{}' used before load", self.name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state().capacity = capacity;
    }

    pub fn is_loaded(&self) -> bool {
        self.state().entries.is_some()
    }

    /// Number of entries in memory, including any not yet pruned
    pub fn len(&self) -> usize {
        self.state().entries.as_ref().map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn references(&self) -> usize {
        self.state().references
    }

    pub(crate) fn retain_reference(&self) {
        self.state().references += 1;
    }

    /// Hydrate entries from the settings store unless already in memory
    pub async fn load(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let stored: VecDeque<CacheEntry> =
            store::get_as(self.store.as_ref(), &self.name).await?.unwrap_or_default();

        let mut state = self.state();
        if state.entries.is_none() {
            debug!("Loaded cache {} with {} entries", self.name, stored.len());
            state.entries = Some(stored);
        }
        Ok(())
    }

    /// Look up a translation, moving a hit to the most-recently-used position
    pub fn get(self: &Arc<Self>, input: &str, target: &str) -> Result<Option<String>> {
        let output = {
            let mut state = self.state();
            let entries = state.entries.as_mut().ok_or_else(|| self.not_loaded())?;
            let position = entries
                .iter()
                .position(|entry| entry.input == input && entry.target == target);
            match position.and_then(|i| entries.remove(i)) {
                Some(entry) => {
                    let output = entry.output.clone();
                    entries.push_front(entry);
                    output
                }
                None => return Ok(None),
            }
        };

        self.schedule_persist();
        Ok(Some(output))
    }

    /// Insert a translation at the most-recently-used position
    ///
    /// An older entry for the same pair is left in place and ages out through
    /// capacity pruning.
    pub fn set(self: &Arc<Self>, input: &str, target: &str, output: &str) -> Result<()> {
        {
            let mut state = self.state();
            let entries = state.entries.as_mut().ok_or_else(|| self.not_loaded())?;
            entries.push_front(CacheEntry {
                input: input.to_string(),
                target: target.to_string(),
                output: output.to_string(),
            });
        }

        self.schedule_persist();
        Ok(())
    }

    /// Arm or re-arm the quiet-window flush
    pub fn schedule_persist(self: &Arc<Self>) {
        let deadline = Instant::now() + self.quiet_window;
        let spawn_flusher = {
            let mut state = self.state();
            match state.flush {
                FlushState::Clean => {
                    state.flush = FlushState::DirtyPending { deadline };
                    true
                }
                FlushState::DirtyPending { .. } => {
                    state.flush = FlushState::DirtyPending { deadline };
                    false
                }
                FlushState::Flushing { .. } => {
                    state.flush = FlushState::Flushing { follow_up: true };
                    false
                }
            }
        };

        if spawn_flusher {
            let cache = Arc::clone(self);
            tokio::spawn(async move { cache.run_flusher().await });
        }
    }

    async fn run_flusher(self: Arc<Self>) {
        loop {
            let deadline = match self.state().flush {
                FlushState::DirtyPending { deadline } => deadline,
                _ => return,
            };
            tokio::time::sleep_until(deadline).await;

            let snapshot = {
                let mut state = self.state();
                match state.flush {
                    FlushState::DirtyPending { deadline } if deadline <= Instant::now() => {
                        Self::begin_flush(&mut state)
                    }
                    // Re-armed while sleeping
                    FlushState::DirtyPending { .. } => continue,
                    _ => return,
                }
            };

            let result = self.write(snapshot).await;
            if !self.finish_flush(result) {
                return;
            }
        }
    }

    /// Prune to capacity and take a snapshot for writing
    fn begin_flush(state: &mut CacheState) -> VecDeque<CacheEntry> {
        state.flush = FlushState::Flushing { follow_up: false };
        let capacity = state.capacity;
        match state.entries.as_mut() {
            Some(entries) => {
                entries.truncate(capacity);
                entries.clone()
            }
            None => VecDeque::new(),
        }
    }

    async fn write(&self, snapshot: VecDeque<CacheEntry>) -> Result<()> {
        debug!("Persisting cache {} ({} entries)", self.name, snapshot.len());
        store::set_as(self.store.as_ref(), &self.name, &snapshot).await
    }

    /// Record the outcome of a write; returns true if another flush is armed
    fn finish_flush(&self, result: Result<()>) -> bool {
        let rearmed = {
            let mut state = self.state();
            if let Err(e) = result {
                error!("Failed to persist cache {}: {}", self.name, e);
                state.flush_error = Some(e.to_string());
            }
            match state.flush {
                FlushState::Flushing { follow_up: true } => {
                    state.flush = FlushState::DirtyPending {
                        deadline: Instant::now() + self.quiet_window,
                    };
                    true
                }
                _ => {
                    state.flush = FlushState::Clean;
                    if state.references == 0 {
                        state.entries = None;
                        debug!("Unloaded cache {} after flush", self.name);
                    }
                    false
                }
            }
        };
        self.flushed.notify_waiters();
        rearmed
    }

    /// Write pending changes now instead of waiting for the quiet window
    pub async fn flush_now(&self) -> Result<()> {
        loop {
            let flushed = self.flushed.notified();
            let snapshot = {
                let mut state = self.state();
                match state.flush {
                    FlushState::Clean => break,
                    FlushState::DirtyPending { .. } => Some(Self::begin_flush(&mut state)),
                    FlushState::Flushing { .. } => None,
                }
            };

            match snapshot {
                Some(snapshot) => {
                    let result = self.write(snapshot).await;
                    self.finish_flush(result);
                }
                None => flushed.await,
            }
        }
        self.take_flush_error()
    }

    fn take_flush_error(&self) -> Result<()> {
        match self.state().flush_error.take() {
            Some(message) => Err(TranspassError::Cache(format!(
                "persisting cache '{}' failed: {}",
                self.name, message
            ))),
            None => Ok(()),
        }
    }

    /// Give up one reference; entries leave memory once unreferenced and flushed
    ///
    /// Surfaces a failed background write since the previous release.
    pub fn release(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.references = state.references.saturating_sub(1);
            if state.references == 0 && state.flush == FlushState::Clean && state.entries.is_some() {
                state.entries = None;
                debug!("Unloaded cache {}", self.name);
            }
        }
        self.take_flush_error()
    }

    /// Drop least-recently-used entries beyond capacity and schedule a write
    pub fn prune(self: &Arc<Self>) -> Result<usize> {
        let removed = {
            let mut state = self.state();
            let capacity = state.capacity;
            let entries = state.entries.as_mut().ok_or_else(|| self.not_loaded())?;
            let before = entries.len();
            entries.truncate(capacity);
            before - entries.len()
        };
        if removed > 0 {
            self.schedule_persist();
        }
        Ok(removed)
    }

    /// Remove every entry, in memory and durably
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(entries) = state.entries.as_mut() {
                entries.clear();
            }
        }
        store::set_as(self.store.as_ref(), &self.name, &Vec::<CacheEntry>::new()).await
    }

    /// Copy of the in-memory entries, most recently used first
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.state()
            .entries
            .as_ref()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}
