// OpenAI-compatible chat completions generator

use super::ContentGenerator;
use crate::config::GeneratorConfig;
use crate::errors::GenerationError;
use crate::substitution::TemplateSubstitutor;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Generates document content with a chat completion request
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    prompt_template: String,
    substitutor: TemplateSubstitutor,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GenerationError::Generation(format!("Failed to build HTTP client: {}", e)))?;

        let substitutor = TemplateSubstitutor::new()
            .map_err(|e| GenerationError::Generation(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            prompt_template: config.prompt_template.clone(),
            substitutor,
        })
    }

    fn build_prompt(&self, fields: &HashMap<String, String>) -> String {
        let prompt = self.substitutor.substitute(&self.prompt_template, fields);
        if !prompt.is_complete() {
            warn!(unresolved = ?prompt.unresolved, "Prompt has unresolved fields");
        }
        prompt.text
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    #[instrument(skip(self, fields), fields(model = %self.model))]
    async fn generate(&self, fields: &HashMap<String, String>) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": self.build_prompt(fields) }],
            "temperature": self.temperature,
        });

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Chat completion request failed");
            GenerationError::Generation(format!("Request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, "Chat completion API error");
            return Err(GenerationError::Generation(format!(
                "API error {}: {}",
                status, text
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Generation(format!("Invalid response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GenerationError::Generation("Empty completion".to_string()))?;

        debug!(chars = content.len(), "Completion received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> GeneratorConfig {
        GeneratorConfig {
            api_base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.7,
            prompt_template: "Estrategia para un negocio de giro {{giro}}".to_string(),
            timeout_seconds: 5,
        }
    }

    fn fields() -> HashMap<String, String> {
        HashMap::from([("giro".to_string(), "panaderia".to_string())])
    }

    #[tokio::test]
    async fn test_generate_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4",
                "messages": [{ "role": "user", "content": "Estrategia para un negocio de giro panaderia" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "  Semana 1: redes  " } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new(&config(&server.uri())).unwrap();
        let content = generator.generate(&fields()).await.unwrap();

        assert_eq!(content, "Semana 1: redes");
    }

    #[tokio::test]
    async fn test_generate_maps_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new(&config(&server.uri())).unwrap();
        let result = generator.generate(&fields()).await;

        match result {
            Err(GenerationError::Generation(msg)) => assert!(msg.contains("429")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new(&config(&server.uri())).unwrap();
        assert!(generator.generate(&fields()).await.is_err());
    }
}
