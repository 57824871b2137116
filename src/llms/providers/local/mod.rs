//! Local inference through an Ollama server.
//!
//! Default endpoint: `http://localhost:11434/api/chat`. The host can be
//! overridden by `OLLAMA_HOST` or the model's `base_url`.

use async_trait::async_trait;
use serde_json::Value;

use crate::conversation::Conversation;
use crate::errors::{BackendError, ConfigError};
use crate::llms::backend::{next_call_sequence, BackendState, ModelBackend};
use crate::llms::providers::utils::{non_empty, send_json};

const PROVIDER: &str = "local";
const DEFAULT_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct LocalBackend {
    pub state: BackendState,
    client: reqwest::Client,
}

impl LocalBackend {
    pub fn new(state: BackendState) -> Result<Self, ConfigError> {
        let client = state.http_client()?;
        Ok(Self { state, client })
    }

    pub fn endpoint(&self) -> String {
        let host = self.state.base_url.as_deref().unwrap_or(DEFAULT_HOST);
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };
        format!("{}/api/chat", host.trim_end_matches('/'))
    }

    pub fn build_request_body(&self, conversation: &Conversation) -> Value {
        serde_json::json!({
            "model": self.state.model,
            "messages": conversation,
            "stream": false,
            "options": {
                "temperature": self.state.temperature,
                "num_predict": self.state.max_tokens,
            },
        })
    }

    pub fn parse_response(&self, response: &Value) -> Result<String, BackendError> {
        let content = response
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: "no message content in response".into(),
            })?;
        non_empty(PROVIDER, content.to_string())
    }
}

#[async_trait]
impl ModelBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.state.key
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError> {
        log::debug!(
            "LocalBackend.complete #{}: model={}, messages={}",
            next_call_sequence(),
            self.state.model,
            conversation.len(),
        );
        let request = self
            .client
            .post(self.endpoint())
            .json(&self.build_request_body(conversation));
        let response = send_json(PROVIDER, request).await?;
        self.parse_response(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, Provider, SimulationConfig};

    fn backend(base_url: Option<&str>) -> LocalBackend {
        let run = SimulationConfig::default();
        let mut model = ModelConfig::new(Provider::Local, "llama3");
        model.base_url = base_url.map(str::to_string);
        LocalBackend::new(BackendState::from_config("llama", &model, &run, None)).unwrap()
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(backend(None).endpoint(), "http://localhost:11434/api/chat");
        assert_eq!(backend(Some("gpu-box:11434")).endpoint(), "http://gpu-box:11434/api/chat");
        assert_eq!(
            backend(Some("https://ollama.internal/")).endpoint(),
            "https://ollama.internal/api/chat"
        );
    }

    #[test]
    fn test_build_request_body() {
        let mut conversation = Conversation::with_system("sys");
        conversation.push_user("Q?");
        let body = backend(None).build_request_body(&conversation);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 1000);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_response() {
        let backend = backend(None);
        let ok = serde_json::json!({"model": "llama3", "message": {"role": "assistant", "content": "5"}, "done": true});
        assert_eq!(backend.parse_response(&ok).unwrap(), "5");
        assert!(backend.parse_response(&serde_json::json!({"done": true})).is_err());
    }
}
