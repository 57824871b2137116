//! Model backend implementations.
//!
//! | Provider | Module | Endpoint |
//! |----------|--------|----------|
//! | OpenAI | [`openai`] | `POST /v1/chat/completions` |
//! | Anthropic | [`anthropic`] | `POST /v1/messages` |
//! | Local | [`local`] | Ollama `POST /api/chat` |
//! | Simulated | [`simulated`] | none |
//!
//! [`utils`] holds the status and transport error mapping the HTTP
//! providers share.

pub mod anthropic;
pub mod local;
pub mod openai;
pub mod simulated;
pub mod utils;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Credentials, ModelConfig, Provider, SimulationConfig};
use crate::errors::ConfigError;
use crate::llms::backend::{BackendState, ModelBackend};
use crate::llms::rate_limit::{RateLimitedBackend, RpmLimiter};

pub use anthropic::AnthropicBackend;
pub use local::LocalBackend;
pub use openai::OpenAIBackend;
pub use simulated::SimulatedBackend;

/// Construct the backend for one configured model.
pub fn build_backend(
    key: &str,
    model: &ModelConfig,
    run: &SimulationConfig,
    credentials: &Credentials,
) -> Result<Arc<dyn ModelBackend>, ConfigError> {
    let api_key = credentials.api_key(key, model.provider)?;
    let mut state = BackendState::from_config(key, model, run, api_key);

    let backend: Arc<dyn ModelBackend> = match model.provider {
        Provider::OpenAI => Arc::new(OpenAIBackend::new(state)?),
        Provider::Anthropic => Arc::new(AnthropicBackend::new(state)?),
        Provider::Local => {
            if state.base_url.is_none() {
                state.base_url = credentials.ollama_host.clone();
            }
            Arc::new(LocalBackend::new(state)?)
        }
        Provider::Simulated => Arc::new(SimulatedBackend::new(key, run.seed, model.simulated)),
    };

    tracing::debug!(model = key, provider = model.provider.as_str(), "backend ready");

    Ok(match model.requests_per_minute {
        Some(rpm) => Arc::new(RateLimitedBackend::new(backend, RpmLimiter::new(rpm))),
        None => backend,
    })
}

/// Backends for every model in the run, keyed like the config.
pub fn build_backends(
    run: &SimulationConfig,
    credentials: &Credentials,
) -> Result<BTreeMap<String, Arc<dyn ModelBackend>>, ConfigError> {
    run.models
        .iter()
        .map(|(key, model)| Ok((key.clone(), build_backend(key, model, run, credentials)?)))
        .collect()
}
