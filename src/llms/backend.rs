//! The model backend abstraction shared by every provider.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{ModelConfig, SimulationConfig};
use crate::conversation::Conversation;
use crate::errors::{BackendError, ConfigError};

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

/// Correlation id attached to the log lines of one logical call.
pub fn generate_call_id() -> String {
    Uuid::new_v4().to_string()
}

static CALL_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Process-wide count of backend requests issued so far.
pub fn next_call_sequence() -> usize {
    CALL_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// ModelBackend trait
// ---------------------------------------------------------------------------

/// A chat model that turns a whole conversation into one reply.
///
/// Implementations are stateless with respect to conversations: every call
/// carries the full history, and the same backend instance is shared by all
/// cells that use the model.
#[async_trait]
pub trait ModelBackend: Send + Sync + fmt::Debug {
    /// Model key as configured, e.g. `gpt-4`. Appears in result keys.
    fn name(&self) -> &str;

    /// Provider identifier used in logs and errors.
    fn provider(&self) -> &str;

    /// Send the conversation and return the assistant's text.
    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError>;
}

// ---------------------------------------------------------------------------
// Shared provider state
// ---------------------------------------------------------------------------

/// Fields every HTTP provider carries.
#[derive(Clone)]
pub struct BackendState {
    /// Configured model key.
    pub key: String,
    /// Model name sent on the wire.
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

impl fmt::Debug for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendState")
            .field("key", &self.key)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl BackendState {
    /// Resolve per-model overrides against the run-wide defaults.
    pub fn from_config(
        key: &str,
        model: &ModelConfig,
        run: &SimulationConfig,
        api_key: Option<String>,
    ) -> Self {
        Self {
            key: key.to_string(),
            model: model.model.clone(),
            api_key,
            base_url: model.base_url.clone(),
            max_tokens: model.max_tokens.unwrap_or(run.max_tokens),
            temperature: model.temperature.unwrap_or(run.temperature),
            timeout: Duration::from_secs(model.timeout_secs),
        }
    }

    /// HTTP client with the model's request timeout.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("failed to build HTTP client for '{}': {}", self.key, e),
            })
    }

    /// The API key, or an auth failure when the provider was built without one.
    pub fn require_api_key(&self, provider: &str) -> Result<&str, BackendError> {
        self.api_key.as_deref().ok_or_else(|| BackendError::AuthFailure {
            provider: provider.to_string(),
            message: format!("no API key configured for '{}'", self.key),
        })
    }
}
