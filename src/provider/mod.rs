// Translation provider adapters
//
// Each vendor is wrapped behind `TranslationProvider`, which translates one
// chunk of strings per call. The router never talks HTTP directly; it asks a
// `ProviderFactory` for a client matching a `ProviderConfig`.
// - Azure: Microsoft Translator v3
// - Google: Cloud Translation v2

pub mod azure;
pub mod google;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

use crate::batch::ChunkLimits;
use crate::config::Config;
use crate::error::{Result, TranspassError};
use crate::settings::{ProviderConfig, Service};

/// Main trait for translation vendors
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Size limits for one request to this vendor
    fn limits(&self) -> ChunkLimits;

    /// Translate one chunk; the result matches `inputs` positionally
    async fn translate_chunk(&self, target: &str, inputs: &[&str]) -> Result<Vec<String>>;
}

/// Builds provider clients from configuration
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &ProviderConfig) -> Box<dyn TranslationProvider>;
}

/// Factory for the real HTTP-backed providers
pub struct HttpProviderFactory {
    client: Client,
    azure_endpoint: String,
    google_endpoint: String,
}

impl HttpProviderFactory {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.http.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            azure_endpoint: config.endpoints.azure.trim_end_matches('/').to_string(),
            google_endpoint: config.endpoints.google.trim_end_matches('/').to_string(),
        })
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, config: &ProviderConfig) -> Box<dyn TranslationProvider> {
        match config.service {
            Service::Azure => Box::new(azure::AzureProvider::new(
                self.client.clone(),
                &self.azure_endpoint,
                &config.api_key,
            )),
            Service::Google => Box::new(google::GoogleProvider::new(
                self.client.clone(),
                &self.google_endpoint,
                &config.api_key,
            )),
        }
    }
}

/// Turn a non-200 response into a provider error
async fn ensure_ok(service: Service, response: Response) -> Result<Response> {
    let status = response.status();
    if status == reqwest::StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!("{} error body: {}", service, body);
    Err(TranspassError::Provider(format!("{} api returned status {}", service, status.as_u16())))
}

/// Check the vendor returned one translation per input
fn ensure_complete(service: Service, expected: usize, outputs: Vec<String>) -> Result<Vec<String>> {
    if outputs.is_empty() && expected > 0 {
        return Err(TranspassError::Provider(format!("{} output was empty", service)));
    }
    if outputs.len() < expected {
        return Err(TranspassError::Provider(format!(
            "{} returned {} translations for {} inputs",
            service,
            outputs.len(),
            expected
        )));
    }
    Ok(outputs.into_iter().take(expected).collect())
}

/// Decode HTML entities the vendors put in their output
fn decode(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}
