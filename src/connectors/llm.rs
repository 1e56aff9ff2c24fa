//! Chat-completion adapter for the [`LlmCapability`] contract.
//!
//! Supports the OpenAI chat completions API (and compatible servers through
//! the base URL override) and the Anthropic messages API. The expected
//! output schema is appended to the system prompt.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::http::{build_client, ensure_success, json_body};
use super::{ConnectorError, LlmCapability, LlmPrompt, OutputSchema};
use crate::config::{LlmConfig, LlmProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Clone)]
pub struct HttpLlm {
    client: Client,
    provider: LlmProvider,
    api_base: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl HttpLlm {
    pub fn new(config: &LlmConfig) -> Result<Self, ConnectorError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ConnectorError::ConfigurationError {
                details: "LLM API key is not configured".to_string(),
            })?;
        Ok(Self {
            client: build_client(config.timeout())?,
            provider: config.provider,
            api_base: config.api_base().trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn system_prompt(prompt: &LlmPrompt, schema: &OutputSchema) -> String {
        format!(
            "{}\n\nThe reply must be a single JSON object matching this JSON schema ({}):\n{}",
            prompt.system, schema.name, schema.schema
        )
    }

    async fn openai(&self, prompt: &LlmPrompt, schema: &OutputSchema) -> Result<String, ConnectorError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": Self::system_prompt(prompt, schema)},
                {"role": "user", "content": prompt.user},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"},
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let parsed: OpenAiResponse = json_body(ensure_success(response).await?).await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| empty_completion("no choices with content"))
    }

    async fn anthropic(&self, prompt: &LlmPrompt, schema: &OutputSchema) -> Result<String, ConnectorError> {
        let body = json!({
            "model": self.model,
            "system": Self::system_prompt(prompt, schema),
            "messages": [{"role": "user", "content": prompt.user}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let response = self
            .client
            .post(format!("{}/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let parsed: AnthropicResponse = json_body(ensure_success(response).await?).await?;
        let text: Vec<String> = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(empty_completion("no text blocks"));
        }
        Ok(text.join(""))
    }
}

fn empty_completion(details: &str) -> ConnectorError {
    ConnectorError::MalformedResponse {
        details: format!("completion is empty: {}", details),
        partial_data: None,
    }
}

#[async_trait]
impl LlmCapability for HttpLlm {
    async fn invoke(&self, prompt: &LlmPrompt, schema: &OutputSchema) -> Result<String, ConnectorError> {
        debug!(
            provider = self.provider.as_str(),
            model = %self.model,
            schema = schema.name,
            prompt_chars = prompt.user.len(),
            "Invoking language model"
        );
        match self.provider {
            LlmProvider::OpenAi => self.openai(prompt, schema).await,
            LlmProvider::Anthropic => self.anthropic(prompt, schema).await,
        }
    }

    fn model_id(&self) -> String {
        format!("{}/{}", self.provider.as_str(), self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(provider: LlmProvider, server: &MockServer) -> LlmConfig {
        LlmConfig {
            provider,
            model: "test-model".into(),
            api_key: Some("sk-test".into()),
            api_base: Some(server.uri()),
            ..LlmConfig::default()
        }
    }

    fn is_json_object(text: &str) -> bool {
        matches!(serde_json::from_str::<Value>(text), Ok(Value::Object(_)))
    }

    fn prompt() -> (LlmPrompt, OutputSchema) {
        (
            LlmPrompt {
                system: "Classify".into(),
                user: "Checkout is broken".into(),
            },
            OutputSchema {
                name: "classification",
                schema: json!({"type": "object"}),
            },
        )
    }

    #[tokio::test]
    async fn test_openai_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"actionable\": true}"}}]
            })))
            .mount(&server)
            .await;

        let llm = HttpLlm::new(&config(LlmProvider::OpenAi, &server)).unwrap();
        let (prompt, schema) = prompt();
        let text = llm.invoke(&prompt, &schema).await.unwrap();
        assert_eq!(text, "{\"actionable\": true}");
        assert_eq!(llm.model_id(), "openai/test-model");
    }

    #[tokio::test]
    async fn test_anthropic_completion_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "{\"actionable\": "},
                    {"type": "text", "text": "false}"}
                ]
            })))
            .mount(&server)
            .await;

        let llm = HttpLlm::new(&config(LlmProvider::Anthropic, &server)).unwrap();
        let (prompt, schema) = prompt();
        let text = llm.invoke(&prompt, &schema).await.unwrap();
        assert!(is_json_object(&text));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529))
            .mount(&server)
            .await;

        let llm = HttpLlm::new(&config(LlmProvider::Anthropic, &server)).unwrap();
        let (prompt, schema) = prompt();
        let err = llm.invoke(&prompt, &schema).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_choices_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let llm = HttpLlm::new(&config(LlmProvider::OpenAi, &server)).unwrap();
        let (prompt, schema) = prompt();
        let err = llm.invoke(&prompt, &schema).await.unwrap_err();
        assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
    }
}
