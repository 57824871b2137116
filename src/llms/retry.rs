//! Bounded retry with exponential backoff around a single backend call.
//!
//! Only `RateLimited`, `Timeout` and `ServerError` are retried. A
//! `Retry-After` hint from the server replaces the computed delay for that
//! attempt, still capped at `max_backoff_ms`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::errors::BackendError;
use crate::llms::backend::{generate_call_id, ModelBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    fn delay_for(&self, attempt: u32, err: &BackendError) -> Duration {
        let cap = Duration::from_millis(self.max_backoff_ms);
        match err.retry_after() {
            Some(hint) => hint.min(cap),
            None => self.backoff(attempt),
        }
    }
}

/// Call `backend`, retrying transient failures according to `policy`.
///
/// Returns the last error once attempts are exhausted, or immediately for
/// errors that are not retryable.
pub async fn complete_with_retry(
    backend: &dyn ModelBackend,
    conversation: &Conversation,
    policy: &RetryPolicy,
) -> Result<String, BackendError> {
    let call_id = generate_call_id();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match backend.complete(conversation).await {
            Ok(text) => {
                if attempt > 1 {
                    log::debug!(
                        "[{}] {} succeeded on attempt {}",
                        call_id,
                        backend.name(),
                        attempt
                    );
                }
                return Ok(text);
            }
            Err(err) if !err.is_retryable() || attempt >= max_attempts => {
                log::debug!(
                    "[{}] {} giving up after {} attempt(s): {}",
                    call_id,
                    backend.name(),
                    attempt,
                    err
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt, &err);
                log::warn!(
                    "[{}] {} attempt {}/{} failed ({}), retrying in {:?}",
                    call_id,
                    backend.name(),
                    attempt,
                    max_attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
