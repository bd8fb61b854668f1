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
    max_characters: 5_000,
};

#[derive(Debug, Serialize)]
struct GoogleRequest<'a> {
    q: &'a [&'a str],
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    data: GoogleData,
}

#[derive(Debug, Deserialize)]
struct GoogleData {
    translations: Vec<GoogleTranslation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTranslation {
    translated_text: String,
}

/// Google Cloud Translation v2
pub struct GoogleProvider {
    client: Client,
    url: String,
    api_key: String,
}

impl GoogleProvider {
    pub fn new(client: Client, endpoint: &str, api_key: &str) -> Self {
        Self {
            client,
            url: format!("{}/language/translate/v2", endpoint),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl TranslationProvider for GoogleProvider {
    fn limits(&self) -> ChunkLimits {
        LIMITS
    }

    async fn translate_chunk(&self, target: &str, inputs: &[&str]) -> Result<Vec<String>> {
        debug!("Sending {} strings to Google ({})", inputs.len(), target);
        let response = self
            .client
            .post(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .json(&GoogleRequest { q: inputs, target })
            .send()
            .await
            .map_err(|e| TranspassError::Provider(format!("google request failed: {}", e)))?;

        let body: GoogleResponse = ensure_ok(Service::Google, response)
            .await?
            .json()
            .await
            .map_err(|e| TranspassError::Provider(format!("google response malformed: {}", e)))?;

        let outputs = body
            .data
            .translations
            .into_iter()
            .map(|t| decode(&t.translated_text))
            .collect();

        ensure_complete(Service::Google, inputs.len(), outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let inputs = ["Hello", "World"];
        let body = GoogleRequest { q: &inputs, target: "de" };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"q": ["Hello", "World"], "target": "de"})
        );
    }

    #[test]
    fn test_response_shape() {
        let json = r#"{"data":{"translations":[
            {"translatedText":"Hallo &amp; Welt","detectedSourceLanguage":"en"}]}}"#;
        let body: GoogleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(decode(&body.data.translations[0].translated_text), "Hallo & Welt");
    }
}
