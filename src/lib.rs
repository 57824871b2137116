//! # persona-sim
//!
//! Simulates psychological questionnaire responses from synthetic personas.
//!
//! The pipeline converts tabular research data into persona and instrument
//! records, renders per-persona prompts from templates, submits questions to
//! LLM backends under three context-retention conditions, and reshapes the
//! nested results into analysis-ready tables.
//!
//! - [`condition`]: question-level, scale-level and full-context turn plans
//! - [`simulation`]: cell execution, reply parsing and the concurrent driver
//! - [`llms`]: the backend trait, HTTP providers, retry and rate limiting
//! - [`output`]: CSV export, summary and result formatting

pub mod condition;
pub mod config;
pub mod conversation;
pub mod convert;
pub mod errors;
pub mod instrument;
pub mod llms;
pub mod output;
pub mod persona;
pub mod prompt;
pub mod results;
pub mod simulation;

#[cfg(test)]
mod testing;

pub use condition::Condition;
pub use config::{Credentials, ModelConfig, Provider, SimulationConfig};
pub use errors::{BackendError, ConfigError, ResponseError, SimulationError};
pub use instrument::{Instrument, InstrumentStore};
pub use llms::ModelBackend;
pub use persona::{Persona, PersonaStore};
pub use prompt::PromptRenderer;
pub use results::{ResponseRecord, ResultMap};
pub use simulation::{RunControl, RunReport, SimulationDriver};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
