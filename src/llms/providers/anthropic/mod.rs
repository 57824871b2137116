//! Anthropic Messages backend.
//!
//! The Messages API takes the system prompt as a top-level `system` field
//! and only `user`/`assistant` turns in `messages`, so the conversation is
//! split before sending. Text blocks of the reply are concatenated.

use async_trait::async_trait;
use serde_json::Value;

use crate::conversation::Conversation;
use crate::errors::{BackendError, ConfigError};
use crate::llms::backend::{next_call_sequence, BackendState, ModelBackend};
use crate::llms::providers::utils::{non_empty, send_json};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    pub state: BackendState,
    pub anthropic_version: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(state: BackendState) -> Result<Self, ConfigError> {
        let client = state.http_client()?;
        Ok(Self {
            state,
            anthropic_version: ANTHROPIC_VERSION.to_string(),
            client,
        })
    }

    pub fn api_base_url(&self) -> String {
        self.state
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn build_request_body(&self, conversation: &Conversation) -> Value {
        let messages: Vec<_> = conversation.dialogue().collect();
        let mut body = serde_json::json!({
            "model": self.state.model,
            "max_tokens": self.state.max_tokens,
            "temperature": self.state.temperature,
            "messages": messages,
        });
        if let Some(system) = conversation.system_prompt() {
            body["system"] = Value::String(system);
        }
        body
    }

    pub fn parse_response(&self, response: &Value) -> Result<String, BackendError> {
        let invalid = |message: String| BackendError::InvalidResponse {
            provider: PROVIDER.to_string(),
            message,
        };

        // Error objects can arrive with a 200 status when streamed through proxies.
        if response.get("type").and_then(Value::as_str) == Some("error") {
            let message = response
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown Anthropic API error");
            return Err(invalid(message.to_string()));
        }

        let blocks = response
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("no content in response".into()))?;
        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();

        if let Some(usage) = response.get("usage") {
            log::debug!(
                "Anthropic token usage: input={}, output={}",
                usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
                usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
            );
        }

        non_empty(PROVIDER, text)
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.state.key
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError> {
        log::debug!(
            "AnthropicBackend.complete #{}: model={}, messages={}",
            next_call_sequence(),
            self.state.model,
            conversation.len(),
        );

        let api_key = self.state.require_api_key(PROVIDER)?;
        let endpoint = format!("{}/v1/messages", self.api_base_url());

        let request = self
            .client
            .post(&endpoint)
            .header("content-type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.anthropic_version)
            .json(&self.build_request_body(conversation));

        let response = send_json(PROVIDER, request).await?;
        self.parse_response(&response)
    }
}
