use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    config::LlmConfig,
    error::{ContextError, ContextResult},
};

/// Single-shot chat completion: one system and one user message in, raw
/// assistant text out.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> ContextResult<String>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> ContextResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> ContextResult<String> {
        if self.config.api_key.trim().is_empty() {
            return Err(ContextError::MissingConfig("OPENAI_API_KEY"));
        }
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.extraction_model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ContextError::LlmStatus { status, body });
        }
        let payload = response.json::<Value>().await?;
        let text = completion_text(&payload);
        if text.is_empty() {
            return Err(ContextError::LlmEmpty);
        }
        Ok(text)
    }
}

fn completion_text(payload: &Value) -> String {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}
