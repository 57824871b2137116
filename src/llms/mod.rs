//! Model backends and the call plumbing around them.
//!
//! - [`backend`] - the `ModelBackend` trait and shared provider state
//! - [`providers`] - OpenAI, Anthropic, local (Ollama) and simulated backends
//! - [`retry`] - bounded exponential backoff for transient failures
//! - [`rate_limit`] - requests-per-minute limiting decorator

pub mod backend;
pub mod providers;
pub mod rate_limit;
pub mod retry;

pub use backend::{generate_call_id, BackendState, ModelBackend};
pub use providers::{build_backend, build_backends};
pub use rate_limit::{RateLimitedBackend, RpmLimiter};
pub use retry::{complete_with_retry, RetryPolicy};
