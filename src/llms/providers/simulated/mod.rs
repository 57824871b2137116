//! Seeded stand-in backend for dry runs.
//!
//! Answers every `[id]`-marked question of the latest user message with an
//! `id: n` line, or with a bare number when the prompt carries no markers.
//! The random stream is seeded from the run seed and the conversation
//! content, so replies do not depend on scheduling order.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use regex::Regex;

use crate::condition::fnv1a;
use crate::config::SimulatedAnswers;
use crate::conversation::Conversation;
use crate::errors::BackendError;
use crate::llms::backend::ModelBackend;

const PROVIDER: &str = "simulated";

static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\[([^\]\s]+)\]").unwrap());

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    key: String,
    seed: u64,
    answers: SimulatedAnswers,
}

impl SimulatedBackend {
    pub fn new(key: impl Into<String>, seed: u64, answers: SimulatedAnswers) -> Self {
        Self {
            key: key.into(),
            seed,
            answers,
        }
    }

    fn rng_for(&self, conversation: &Conversation, prompt: &str) -> ChaCha8Rng {
        let system = conversation.system_prompt().unwrap_or_default();
        let seed = fnv1a(&[
            &self.seed.to_le_bytes(),
            self.key.as_bytes(),
            system.as_bytes(),
            &(conversation.len() as u64).to_le_bytes(),
            prompt.as_bytes(),
        ]);
        ChaCha8Rng::seed_from_u64(seed)
    }

    /// Reply text for a prompt, deterministic in its inputs.
    pub fn reply(&self, conversation: &Conversation) -> Result<String, BackendError> {
        let prompt = conversation
            .last_user_message()
            .ok_or_else(|| BackendError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: "conversation has no user message".into(),
            })?;

        let mut rng = self.rng_for(conversation, prompt);
        let (min, max) = (self.answers.min, self.answers.max);
        let ids: Vec<&str> = MARKER
            .captures_iter(prompt)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();

        if ids.is_empty() {
            return Ok(rng.gen_range(min..=max).to_string());
        }
        let lines: Vec<String> = ids
            .iter()
            .map(|id| format!("{}: {}", id, rng.gen_range(min..=max)))
            .collect();
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl ModelBackend for SimulatedBackend {
    fn name(&self) -> &str {
        &self.key
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError> {
        self.reply(conversation)
    }
}
