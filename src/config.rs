//! Run configuration.
//!
//! A `SimulationConfig` is built once at startup, either from defaults or
//! from a YAML/JSON file, validated, and then shared read-only as
//! `Arc<SimulationConfig>`. API credentials never live in the config file;
//! they are resolved from the environment into [`Credentials`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::errors::ConfigError;
use crate::llms::retry::RetryPolicy;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Which wire protocol a model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI Chat Completions.
    #[serde(alias = "gpt")]
    OpenAI,
    /// Anthropic Messages.
    Anthropic,
    /// Local inference through an Ollama server.
    #[serde(alias = "ollama")]
    Local,
    /// Seeded random answers, no network.
    Simulated,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Local => "local",
            Self::Simulated => "simulated",
        }
    }

    /// Environment variable holding the API key, for providers that need one.
    pub fn credential_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some(OPENAI_API_KEY_ENV),
            Self::Anthropic => Some(ANTHROPIC_API_KEY_ENV),
            Self::Local | Self::Simulated => None,
        }
    }
}

/// Answer range used by the simulated provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedAnswers {
    pub min: i64,
    pub max: i64,
}

impl Default for SimulatedAnswers {
    fn default() -> Self {
        Self { min: 1, max: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Model name sent to the API, e.g. `claude-3-sonnet-20240229`.
    pub model: String,
    /// Overrides the provider's default endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Client-side requests-per-minute cap. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    /// Per-model overrides of the run-wide generation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub simulated: SimulatedAnswers,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ModelConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            timeout_secs: default_timeout_secs(),
            requests_per_minute: None,
            max_tokens: None,
            temperature: None,
            simulated: SimulatedAnswers::default(),
        }
    }
}

fn default_models() -> BTreeMap<String, ModelConfig> {
    BTreeMap::from([
        ("gpt-4".to_string(), ModelConfig::new(Provider::OpenAI, "gpt-4")),
        (
            "claude".to_string(),
            ModelConfig::new(Provider::Anthropic, "claude-3-sonnet-20240229"),
        ),
        ("llama".to_string(), ModelConfig::new(Provider::Local, "llama3")),
    ])
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub personas: PathBuf,
    pub instruments: PathBuf,
    /// Nested result map written by `simulate`.
    pub results: PathBuf,
    /// Directory for `condition_N.csv` and the summary files.
    pub output_dir: PathBuf,
    pub prompts_dir: PathBuf,
    /// Optional system prompt template replacing the built-in one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_template: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            personas: PathBuf::from("outputs/personas.json"),
            instruments: PathBuf::from("outputs/instruments.json"),
            results: PathBuf::from("outputs/simulation_results.json"),
            output_dir: PathBuf::from("outputs/csv"),
            prompts_dir: PathBuf::from("outputs/persona_prompts"),
            system_template: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SimulationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Models by key. The key is what appears in result keys and CSV rows.
    pub models: BTreeMap<String, ModelConfig>,
    pub conditions: Vec<Condition>,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Base seed for orderings and simulated answers.
    pub seed: u64,
    /// Cells running at once.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Stop scheduling new cells after this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    pub required_demographics: Vec<String>,
    pub paths: PathsConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            conditions: Condition::ALL.to_vec(),
            max_tokens: 1000,
            temperature: 0.7,
            seed: 42,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            run_timeout_secs: None,
            required_demographics: ["age", "gender", "education", "occupation", "location"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            paths: PathsConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Load from a `.json` file or, for any other extension, YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let load_err = |message: String| ConfigError::Load {
            path: path.to_path_buf(),
            message,
        };

        let raw = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| load_err(e.to_string()))?
        };

        config.validate()?;
        tracing::info!(
            path = %path.display(),
            models = config.models.len(),
            conditions = config.conditions.len(),
            "loaded simulation config"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.models.is_empty() {
            return invalid("no models configured".into());
        }
        for (key, model) in &self.models {
            if key.trim().is_empty() {
                return invalid("model key is empty".into());
            }
            if model.model.trim().is_empty() {
                return invalid(format!("model '{}' has no model name", key));
            }
            if model.timeout_secs == 0 {
                return invalid(format!("model '{}' has a zero timeout", key));
            }
            if model.requests_per_minute == Some(0) {
                return invalid(format!("model '{}' allows zero requests per minute", key));
            }
            if model.provider == Provider::Simulated && model.simulated.min > model.simulated.max {
                return invalid(format!("model '{}' has an empty simulated answer range", key));
            }
        }
        if self.conditions.is_empty() {
            return invalid("no conditions selected".into());
        }
        let mut seen = self.conditions.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.conditions.len() {
            return invalid("conditions contain duplicates".into());
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!("temperature {} outside 0..=2", self.temperature));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Keep only the named models, in the given order of preference.
    pub fn select_models(&mut self, keys: &[String]) -> Result<(), ConfigError> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = keys.iter().find(|k| !self.models.contains_key(*k)) {
            return Err(ConfigError::Invalid {
                message: format!("unknown model '{}'", unknown),
            });
        }
        self.models.retain(|key, _| keys.contains(key));
        Ok(())
    }

    /// Fail fast when an input file of the run does not exist.
    pub fn require_inputs(&self) -> Result<(), ConfigError> {
        for path in [&self.paths.personas, &self.paths.instruments]
            .into_iter()
            .chain(self.paths.system_template.as_ref())
        {
            if !path.is_file() {
                return Err(ConfigError::MissingFile { path: path.clone() });
            }
        }
        Ok(())
    }

    /// Fail fast when a selected model has no credential available.
    pub fn check_credentials(&self, credentials: &Credentials) -> Result<(), ConfigError> {
        for (key, model) in &self.models {
            credentials.api_key(key, model.provider)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// API keys and endpoints resolved from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub ollama_host: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("openai_api_key", &mask(&self.openai_api_key))
            .field("anthropic_api_key", &mask(&self.anthropic_api_key))
            .field("ollama_host", &self.ollama_host)
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            openai_api_key: non_empty(OPENAI_API_KEY_ENV),
            anthropic_api_key: non_empty(ANTHROPIC_API_KEY_ENV),
            ollama_host: non_empty(OLLAMA_HOST_ENV),
        }
    }

    /// API key for `provider`. `Ok(None)` for providers that need none.
    pub fn api_key(&self, model_key: &str, provider: Provider) -> Result<Option<String>, ConfigError> {
        let key = match provider {
            Provider::OpenAI => &self.openai_api_key,
            Provider::Anthropic => &self.anthropic_api_key,
            Provider::Local | Provider::Simulated => return Ok(None),
        };
        match key {
            Some(key) => Ok(Some(key.clone())),
            None => Err(ConfigError::MissingCredential {
                model: model_key.to_string(),
                env_var: provider.credential_env().unwrap_or_default().to_string(),
            }),
        }
    }
}
