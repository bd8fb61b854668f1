use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{Result, TranspassError};
use crate::store::{self, SettingsStore};

pub const KEY_TARGET: &str = "target";
pub const KEY_CACHE_SIZE: &str = "cacheSize";
pub const KEY_OVERRIDES: &str = "overrides";
pub const KEY_PROVIDERS: &str = "providers";
pub const KEY_QUOTAS: &str = "quotas";

/// Prefix shared by every cache entry sequence in the store
pub const CACHE_PREFIX: &str = "cache-";
pub const DEFAULT_CACHE_NAME: &str = "cache-default";

// Default values for runtime settings
fn default_target() -> String {
    "en".to_string()
}

fn default_cache_size() -> usize {
    1000
}

fn default_dedicated_cache_size() -> usize {
    500
}

fn default_reset_on() -> u32 {
    1
}

/// External translation vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Azure,
    Google,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Azure => write!(f, "azure"),
            Service::Google => write!(f, "google"),
        }
    }
}

/// A configured translation provider
///
/// List order among enabled providers is the fallback priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub service: Service,
    pub enabled: bool,
    pub api_key: String,
    /// Identity of this provider's quota record; also used as the provider id
    pub quota_key: String,
    /// Day of month on which the billing cycle restarts
    #[serde(default = "default_reset_on")]
    pub reset_on: u32,
    /// Characters after which usage is reported as a warning (0 = never)
    #[serde(default)]
    pub warn_after: u64,
    /// Characters after which the provider is skipped (0 = unlimited)
    #[serde(default)]
    pub stop_after: u64,
}

impl ProviderConfig {
    /// New enabled provider with the vendor's free-tier thresholds
    pub fn new(service: Service, api_key: impl Into<String>) -> Self {
        let (warn_after, stop_after) = match service {
            Service::Azure => (1_980_000, 1_995_000),
            Service::Google => (480_000, 485_000),
        };
        Self {
            service,
            enabled: true,
            api_key: api_key.into(),
            quota_key: format!("quota-{}-{}", service, uuid::Uuid::new_v4()),
            reset_on: default_reset_on(),
            warn_after,
            stop_after,
        }
    }

    pub fn id(&self) -> &str {
        &self.quota_key
    }
}

/// How an override's pattern is compared with a page URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    /// Pattern occurs in the URL host
    DomainSubstring,
    /// Pattern occurs anywhere in the full URL
    WholeUrl,
    /// Pattern is a regular expression matched against the full URL
    Regex,
}

/// Per-domain routing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub match_pattern: String,
    pub match_mode: MatchMode,
    #[serde(default)]
    pub dedicated_cache: bool,
    pub dedicated_cache_name: String,
    #[serde(default = "default_dedicated_cache_size")]
    pub dedicated_cache_size: usize,
    /// Never call providers for automatic translation under this rule
    #[serde(default)]
    pub cache_only: bool,
}

impl Override {
    pub fn new(match_pattern: impl Into<String>, match_mode: MatchMode) -> Self {
        Self {
            match_pattern: match_pattern.into(),
            match_mode,
            dedicated_cache: false,
            dedicated_cache_name: format!("{}{}", CACHE_PREFIX, uuid::Uuid::new_v4()),
            dedicated_cache_size: default_dedicated_cache_size(),
            cache_only: false,
        }
    }

    /// True if this rule applies to `url`
    pub fn matches(&self, url: &Url) -> bool {
        if self.match_pattern.is_empty() {
            return false;
        }
        match self.match_mode {
            MatchMode::DomainSubstring => url
                .host_str()
                .is_some_and(|host| host.contains(&self.match_pattern)),
            MatchMode::WholeUrl => url.as_str().contains(&self.match_pattern),
            MatchMode::Regex => match Regex::new(&self.match_pattern) {
                Ok(re) => re.is_match(url.as_str()),
                Err(e) => {
                    warn!("Ignoring override with invalid pattern '{}': {}", self.match_pattern, e);
                    false
                }
            },
        }
    }
}

/// Which cache a request reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSelector {
    pub name: String,
    pub capacity: usize,
    pub cache_only: bool,
}

/// Runtime settings held in the settings store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub overrides: Vec<Override>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: default_target(),
            cache_size: default_cache_size(),
            overrides: Vec::new(),
            providers: Vec::new(),
        }
    }
}

impl Settings {
    /// Read every settings key, falling back to defaults for missing ones
    pub async fn load(store: &dyn SettingsStore) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            target: store::get_as(store, KEY_TARGET).await?.unwrap_or(defaults.target),
            cache_size: store::get_as(store, KEY_CACHE_SIZE).await?.unwrap_or(defaults.cache_size),
            overrides: store::get_as(store, KEY_OVERRIDES).await?.unwrap_or_default(),
            providers: store::get_as(store, KEY_PROVIDERS).await?.unwrap_or_default(),
        })
    }

    /// Settings keys and values in store layout
    pub fn to_entries(&self) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(vec![
            (KEY_TARGET.to_string(), serde_json::to_value(&self.target)?),
            (KEY_CACHE_SIZE.to_string(), serde_json::to_value(self.cache_size)?),
            (KEY_OVERRIDES.to_string(), serde_json::to_value(&self.overrides)?),
            (KEY_PROVIDERS.to_string(), serde_json::to_value(&self.providers)?),
        ])
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(TranspassError::Settings("target language is empty".to_string()));
        }
        for provider in &self.providers {
            if !(1..=31).contains(&provider.reset_on) {
                return Err(TranspassError::Settings(format!(
                    "provider {} has reset day {} outside 1..=31",
                    provider.quota_key, provider.reset_on
                )));
            }
            if provider.quota_key.is_empty() {
                return Err(TranspassError::Settings(format!(
                    "{} provider has an empty quota key",
                    provider.service
                )));
            }
        }
        for rule in self.overrides.iter().filter(|rule| rule.dedicated_cache) {
            if !rule.dedicated_cache_name.starts_with(CACHE_PREFIX) {
                return Err(TranspassError::Settings(format!(
                    "dedicated cache name '{}' must start with '{}'",
                    rule.dedicated_cache_name, CACHE_PREFIX
                )));
            }
            if rule.dedicated_cache_name == DEFAULT_CACHE_NAME {
                return Err(TranspassError::Settings(format!(
                    "override '{}' cannot use the default cache name",
                    rule.match_pattern
                )));
            }
        }
        Ok(())
    }

    /// First override in list order that applies to `url`
    pub fn find_override(&self, url: &str) -> Option<&Override> {
        let url = match Url::parse(url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot match overrides against '{}': {}", url, e);
                return None;
            }
        };
        self.overrides.iter().find(|rule| rule.matches(&url))
    }

    /// Cache used for requests under `rule`, or the default cache
    pub fn cache_selector(&self, rule: Option<&Override>) -> CacheSelector {
        match rule {
            Some(rule) if rule.dedicated_cache => CacheSelector {
                name: rule.dedicated_cache_name.clone(),
                capacity: rule.dedicated_cache_size,
                cache_only: rule.cache_only,
            },
            _ => CacheSelector {
                name: DEFAULT_CACHE_NAME.to_string(),
                capacity: self.cache_size,
                cache_only: rule.is_some_and(|rule| rule.cache_only),
            },
        }
    }
}
