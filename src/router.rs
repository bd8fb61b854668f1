//! Multi-provider fallback routing.
//!
//! A request first consults its cache. Misses are sent to the enabled
//! providers in configured order: a provider whose budget cannot cover the
//! whole miss set is skipped before any network call, while any other provider
//! failure ends the request. Callers always get one output per input; failed
//! inputs come back untranslated alongside a [`TranslationError`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::batch::{self, Miss};
use crate::cache::{CacheRegistry, CacheStore};
use crate::error::Result;
use crate::provider::ProviderFactory;
use crate::quota::{BudgetCheck, QuotaLedger};
use crate::settings::{CacheSelector, ProviderConfig};

/// Failure reported to callers in place of translated output
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum TranslationError {
    #[error("no translation providers are enabled")]
    NoProviders,

    #[error("every enabled provider is over its character quota")]
    AllProvidersQuotaExceeded,

    #[error("provider error: {0}")]
    ProviderError(String),
}

/// Where a response's translations came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsedProvider {
    Cache,
    /// Provider id (its quota key)
    Provider(String),
}

impl UsedProvider {
    pub fn as_str(&self) -> &str {
        match self {
            UsedProvider::Cache => "cache",
            UsedProvider::Provider(id) => id,
        }
    }
}

impl fmt::Display for UsedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for UsedProvider {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponse {
    /// One entry per input, untranslated where translation failed
    pub outputs: Vec<String>,
    pub used_provider: Option<UsedProvider>,
    pub error: Option<TranslationError>,
}

/// One routed translation
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub target: &'a str,
    pub inputs: &'a [String],
    pub cache: &'a CacheSelector,
    pub providers: &'a [ProviderConfig],
    /// Explicitly requested by the user, which bypasses cache-only rules
    pub manual: bool,
}

/// Collected outputs for one request, indexed like its inputs
struct Outputs<'a> {
    inputs: &'a [String],
    slots: Vec<Option<String>>,
}

impl<'a> Outputs<'a> {
    fn new(inputs: &'a [String]) -> Self {
        Self { inputs, slots: vec![None; inputs.len()] }
    }

    fn fill(&mut self, index: usize, output: String) {
        self.slots[index] = Some(output);
    }

    /// Copy every miss through untranslated
    fn pass_through(&mut self, misses: &[Miss]) {
        for miss in misses {
            self.slots[miss.index] = Some(miss.input.clone());
        }
    }

    fn finish(self, used_provider: Option<UsedProvider>, error: Option<TranslationError>) -> TranslateResponse {
        let outputs = self
            .slots
            .into_iter()
            .zip(self.inputs)
            .map(|(slot, input)| slot.unwrap_or_else(|| input.clone()))
            .collect();
        TranslateResponse { outputs, used_provider, error }
    }
}

pub struct ProviderRouter {
    caches: Arc<CacheRegistry>,
    ledger: Arc<QuotaLedger>,
    factory: Arc<dyn ProviderFactory>,
}

impl ProviderRouter {
    pub fn new(caches: Arc<CacheRegistry>, ledger: Arc<QuotaLedger>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self { caches, ledger, factory }
    }

    /// Translate `request.inputs`, serving hits from cache and misses from providers
    ///
    /// Provider failures are reported in the response; settings-store
    /// failures on this request's own reads and quota writes are returned as
    /// `Err`. A failed background cache write reported at release belongs to
    /// an earlier flush and is logged instead, so translated outputs are kept.
    pub async fn translate(&self, request: RouteRequest<'_>) -> Result<TranslateResponse> {
        let cache = self.caches.acquire(&request.cache.name, request.cache.capacity);
        let routed = self.route(&cache, request).await;
        let released = cache.release();
        let response = routed?;
        if let Err(e) = released {
            error!("Background write of {} failed: {}", cache.name(), e);
        }
        Ok(response)
    }

    async fn route(&self, cache: &Arc<CacheStore>, request: RouteRequest<'_>) -> Result<TranslateResponse> {
        cache.load().await?;

        let mut outputs = Outputs::new(request.inputs);
        let mut misses = Vec::new();
        for (index, input) in request.inputs.iter().enumerate() {
            match cache.get(input, request.target)? {
                Some(output) => outputs.fill(index, output),
                None => misses.push(Miss { index, input: input.clone() }),
            }
        }

        if misses.is_empty() {
            debug!("All {} inputs served from {}", request.inputs.len(), cache.name());
            return Ok(outputs.finish(Some(UsedProvider::Cache), None));
        }

        if request.cache.cache_only && !request.manual {
            debug!("Cache-only rule: passing {} misses through", misses.len());
            outputs.pass_through(&misses);
            return Ok(outputs.finish(Some(UsedProvider::Cache), None));
        }

        let providers: Vec<&ProviderConfig> = request.providers.iter().filter(|p| p.enabled).collect();
        if providers.is_empty() {
            warn!("No providers enabled; {} misses left untranslated", misses.len());
            outputs.pass_through(&misses);
            return Ok(outputs.finish(None, Some(TranslationError::NoProviders)));
        }

        for provider in providers {
            let client = self.factory.create(provider);
            let chunks = batch::chunk(&misses, client.limits());
            let characters = batch::total_characters(&chunks) as u64;

            if let BudgetCheck::Exceeded { current, limit, .. } = self.ledger.check_budget(provider, characters) {
                warn!("Quota exceeded for {} ({} + {} > {}), trying next provider",
                      provider.id(), current, characters, limit);
                continue;
            }

            info!("Translating {} strings ({} characters, {} chunks) with {}",
                  misses.len(), characters, chunks.len(), provider.id());

            for chunk in &chunks {
                let texts: Vec<&str> = chunk.items.iter().map(|miss| miss.input.as_str()).collect();
                let translations = match client.translate_chunk(request.target, &texts).await {
                    Ok(translations) => translations,
                    Err(e) => {
                        // Chunks already translated stay cached and counted
                        warn!("Provider {} failed: {}", provider.id(), e);
                        outputs.pass_through(&misses);
                        return Ok(outputs.finish(
                            Some(UsedProvider::Provider(provider.id().to_string())),
                            Some(TranslationError::ProviderError(e.to_string())),
                        ));
                    }
                };

                self.ledger.consume(provider, chunk.characters as u64).await?;
                for (miss, output) in chunk.items.iter().zip(translations) {
                    cache.set(&miss.input, request.target, &output)?;
                    outputs.fill(miss.index, output);
                }
            }

            return Ok(outputs.finish(Some(UsedProvider::Provider(provider.id().to_string())), None));
        }

        warn!("All providers over quota; {} misses left untranslated", misses.len());
        outputs.pass_through(&misses);
        Ok(outputs.finish(None, Some(TranslationError::AllProvidersQuotaExceeded)))
    }
}
