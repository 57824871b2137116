//! OpenAI Chat Completions backend.
//!
//! Sends the full conversation to `POST {base_url}/chat/completions` and
//! returns the first choice's message content.

use async_trait::async_trait;
use serde_json::Value;

use crate::conversation::Conversation;
use crate::errors::{BackendError, ConfigError};
use crate::llms::backend::{next_call_sequence, BackendState, ModelBackend};
use crate::llms::providers::utils::{non_empty, send_json};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIBackend {
    pub state: BackendState,
    /// Sent as `OpenAI-Organization` when set.
    pub organization: Option<String>,
    client: reqwest::Client,
}

impl OpenAIBackend {
    pub fn new(state: BackendState) -> Result<Self, ConfigError> {
        let client = state.http_client()?;
        Ok(Self {
            state,
            organization: std::env::var("OPENAI_ORGANIZATION").ok(),
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
        serde_json::json!({
            "model": self.state.model,
            "messages": conversation,
            "max_tokens": self.state.max_tokens,
            "temperature": self.state.temperature,
        })
    }

    pub fn parse_response(&self, response: &Value) -> Result<String, BackendError> {
        let invalid = |message: &str| BackendError::InvalidResponse {
            provider: PROVIDER.to_string(),
            message: message.to_string(),
        };

        let message = response
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| invalid("no choices in response"))?;
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("choice has no text content"))?;

        if let Some(usage) = response.get("usage") {
            log::debug!(
                "OpenAI token usage: prompt={}, completion={}, total={}",
                usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
                usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0),
                usage.get("total_tokens").and_then(Value::as_i64).unwrap_or(0),
            );
        }

        non_empty(PROVIDER, content.to_string())
    }
}

#[async_trait]
impl ModelBackend for OpenAIBackend {
    fn name(&self) -> &str {
        &self.state.key
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError> {
        log::debug!(
            "OpenAIBackend.complete #{}: model={}, messages={}",
            next_call_sequence(),
            self.state.model,
            conversation.len(),
        );

        let api_key = self.state.require_api_key(PROVIDER)?;
        let endpoint = format!("{}/chat/completions", self.api_base_url());

        let mut request = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&self.build_request_body(conversation));
        if let Some(ref org) = self.organization {
            request = request.header("OpenAI-Organization", org);
        }

        let response = send_json(PROVIDER, request).await?;
        self.parse_response(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, Provider, SimulationConfig};

    fn backend() -> OpenAIBackend {
        let run = SimulationConfig::default();
        let model = ModelConfig::new(Provider::OpenAI, "gpt-4");
        OpenAIBackend::new(BackendState::from_config("gpt-4", &model, &run, Some("sk".into()))).unwrap()
    }

    #[test]
    fn test_api_base_url() {
        let mut backend = backend();
        assert_eq!(backend.api_base_url(), "https://api.openai.com/v1");
        backend.state.base_url = Some("http://localhost:8080/v1".into());
        assert_eq!(backend.api_base_url(), "http://localhost:8080/v1");
    }

    #[test]
    fn test_build_request_body() {
        let mut conversation = Conversation::with_system("You are persona 1.");
        conversation.push_user("Rate: I am original.");
        let body = backend().build_request_body(&conversation);

        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Rate: I am original.");
    }

    #[test]
    fn test_parse_response_text() {
        let response = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "4"}}],
            "usage": {"prompt_tokens": 20, "completion_tokens": 1, "total_tokens": 21}
        });
        assert_eq!(backend().parse_response(&response).unwrap(), "4");
    }

    #[test]
    fn test_parse_response_invalid_shapes() {
        let backend = backend();
        for response in [
            serde_json::json!({"choices": []}),
            serde_json::json!({"choices": [{"message": {"content": null}}]}),
            serde_json::json!({"choices": [{"message": {"content": ""}}]}),
        ] {
            assert!(matches!(
                backend.parse_response(&response),
                Err(BackendError::InvalidResponse { .. })
            ));
        }
    }

    /// Integration test, requires OPENAI_API_KEY.
    #[tokio::test]
    #[ignore]
    async fn test_openai_real_call() {
        let run = SimulationConfig::default();
        let model = ModelConfig::new(Provider::OpenAI, "gpt-4");
        let state = BackendState::from_config("gpt-4", &model, &run, std::env::var("OPENAI_API_KEY").ok());
        let backend = OpenAIBackend::new(state).unwrap();
        let mut conversation = Conversation::with_system("Answer with a single number.");
        conversation.push_user("On a scale from 1 to 5, how much do you like rain?");
        let reply = backend.complete(&conversation).await;
        assert!(reply.is_ok(), "Failed: {:?}", reply.err());
    }
}
