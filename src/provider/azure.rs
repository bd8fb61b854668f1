use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode, ensure_complete, ensure_ok, TranslationProvider};
use crate::batch::ChunkLimits;
use crate::error::{Result, TranspassError};
use crate::settings::Service;

pub const LIMITS: ChunkLimits = ChunkLimits {
    max_items: 100,
    max_characters: 10_000,
};

#[derive(Debug, Serialize)]
struct AzureInput<'a> {
    #[serde(rename = "Text")]
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AzureResult {
    translations: Vec<AzureTranslation>,
}

#[derive(Debug, Deserialize)]
struct AzureTranslation {
    text: String,
}

/// Microsoft Translator v3
pub struct AzureProvider {
    client: Client,
    url: String,
    api_key: String,
}

impl AzureProvider {
    pub fn new(client: Client, endpoint: &str, api_key: &str) -> Self {
        Self {
            client,
            url: format!("{}/translate", endpoint),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl TranslationProvider for AzureProvider {
    fn limits(&self) -> ChunkLimits {
        LIMITS
    }

    async fn translate_chunk(&self, target: &str, inputs: &[&str]) -> Result<Vec<String>> {
        let body: Vec<AzureInput<'_>> = inputs.iter().map(|&text| AzureInput { text }).collect();

        debug!("Sending {} strings to Azure ({})", inputs.len(), target);
        let response = self
            .client
            .post(&self.url)
            .query(&[("api-version", "3.0"), ("to", target)])
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TranspassError::Provider(format!("azure request failed: {}", e)))?;

        let results: Vec<AzureResult> = ensure_ok(Service::Azure, response)
            .await?
            .json()
            .await
            .map_err(|e| TranspassError::Provider(format!("azure response malformed: {}", e)))?;

        let outputs = results
            .into_iter()
            .map(|result| {
                result
                    .translations
                    .into_iter()
                    .next()
                    .map(|t| decode(&t.text))
                    .ok_or_else(|| TranspassError::Provider("azure result without translations".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        ensure_complete(Service::Azure, inputs.len(), outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = vec![AzureInput { text: "Hello" }, AzureInput { text: "World" }];
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!([{"Text": "Hello"}, {"Text": "World"}])
        );
    }

    #[test]
    fn test_response_shape() {
        let json = r#"[{"detectedLanguage":{"language":"en","score":1.0},
                        "translations":[{"text":"Bonjour","to":"fr"}]}]"#;
        let results: Vec<AzureResult> = serde_json::from_str(json).unwrap();
        assert_eq!(results[0].translations[0].text, "Bonjour");
    }
}
