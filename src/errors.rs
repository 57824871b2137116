//! Error types for the simulation pipeline.
//!
//! Fatal errors (`ConfigError`, `StoreError`, auth failures) abort a run.
//! Everything else is recorded against the affected cell or question and
//! surfaces only in the final summary.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Errors raised while building the run configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A credential required by a selected model is not set.
    #[error("missing credential {env_var} required by model '{model}'")]
    MissingCredential { model: String, env_var: String },

    /// A required input file does not exist.
    #[error("input file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    /// The configuration file could not be read or parsed.
    #[error("failed to load config {}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    /// The configuration is structurally invalid.
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating persona and instrument stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate persona id {0}")]
    DuplicatePersona(u64),

    #[error("instrument '{instrument}': duplicate question id '{question_id}'")]
    DuplicateQuestion {
        instrument: String,
        question_id: String,
    },

    #[error("scale '{scale}' appears in more than one instrument")]
    DuplicateScale { scale: String },

    #[error("invalid instrument '{instrument}': {message}")]
    InvalidInstrument { instrument: String, message: String },
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Coarse classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    RateLimited,
    AuthFailure,
    Timeout,
    ServerError,
    InvalidResponse,
}

/// A failed call to a model backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{provider}: rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider}: authentication failed: {message}")]
    AuthFailure { provider: String, message: String },

    #[error("{provider}: request timed out")]
    Timeout { provider: String },

    #[error("{provider}: server error ({status}): {message}")]
    ServerError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: invalid response: {message}")]
    InvalidResponse { provider: String, message: String },
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            Self::RateLimited { .. } => BackendErrorKind::RateLimited,
            Self::AuthFailure { .. } => BackendErrorKind::AuthFailure,
            Self::Timeout { .. } => BackendErrorKind::Timeout,
            Self::ServerError { .. } => BackendErrorKind::ServerError,
            Self::InvalidResponse { .. } => BackendErrorKind::InvalidResponse,
        }
    }

    /// Whether the call may succeed if repeated after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            BackendErrorKind::RateLimited | BackendErrorKind::Timeout | BackendErrorKind::ServerError
        )
    }

    /// Whether the error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        self.kind() == BackendErrorKind::AuthFailure
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The per-question error reason for a non-fatal failure.
    pub fn response_error(&self) -> Option<ResponseError> {
        match self.kind() {
            BackendErrorKind::RateLimited => Some(ResponseError::RateLimited),
            BackendErrorKind::Timeout => Some(ResponseError::Timeout),
            BackendErrorKind::ServerError => Some(ResponseError::ServerError),
            BackendErrorKind::InvalidResponse => Some(ResponseError::InvalidResponse),
            BackendErrorKind::AuthFailure => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-question outcomes
// ---------------------------------------------------------------------------

/// Reason a question has no value in the result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseError {
    Unparseable,
    OutOfRange,
    RateLimited,
    Timeout,
    ServerError,
    InvalidResponse,
    TemplateError,
}

impl ResponseError {
    pub const ALL: [ResponseError; 7] = [
        Self::Unparseable,
        Self::OutOfRange,
        Self::RateLimited,
        Self::Timeout,
        Self::ServerError,
        Self::InvalidResponse,
        Self::TemplateError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unparseable => "unparseable",
            Self::OutOfRange => "out_of_range",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::InvalidResponse => "invalid_response",
            Self::TemplateError => "template_error",
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to extract a valid integer from a model reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no integer answer found")]
    Unparseable,

    #[error("answer {value} outside {min}..={max}")]
    OutOfRange { value: i64, min: i64, max: i64 },
}

impl From<ParseError> for ResponseError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Unparseable => ResponseError::Unparseable,
            ParseError::OutOfRange { .. } => ResponseError::OutOfRange,
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Rendering failure. Aborts the affected cell only.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template '{name}' failed to parse: {message}")]
    Parse { name: String, message: String },

    #[error("template '{name}' failed to render: {message}")]
    Render { name: String, message: String },

    #[error("failed to read template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Conversion / export stages
// ---------------------------------------------------------------------------

/// Errors raised by the tabular conversion stages.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to read {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{}: missing required column '{column}'", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("{}: duplicate question number '{number}' (scale '{scale}')", path.display())]
    DuplicateQuestion {
        path: PathBuf,
        number: String,
        scale: String,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while writing or reading exported tables.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to serialize {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}: unknown column '{column}'", path.display())]
    UnknownColumn { path: PathBuf, column: String },

    #[error("{}: invalid value '{value}' in column '{column}'", path.display())]
    InvalidValue {
        path: PathBuf,
        column: String,
        value: String,
    },

    /// Two questions flatten to the same `{Scale}_{Subscale}_{QuestionID}` header.
    #[error("column '{column}' is produced by more than one question")]
    DuplicateColumn { column: String },

    #[error("{}: malformed results: {message}", path.display())]
    InvalidResults { path: PathBuf, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Run level
// ---------------------------------------------------------------------------

/// Errors that abort a simulation run.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("aborting run: {0}")]
    Auth(BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limited() -> BackendError {
        BackendError::RateLimited {
            provider: "openai".into(),
            retry_after: Some(Duration::from_secs(2)),
        }
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(rate_limited().is_retryable());
        assert!(BackendError::Timeout { provider: "x".into() }.is_retryable());
        assert!(BackendError::ServerError {
            provider: "x".into(),
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!BackendError::InvalidResponse {
            provider: "x".into(),
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_auth_failure_is_fatal_and_unrecorded() {
        let err = BackendError::AuthFailure {
            provider: "anthropic".into(),
            message: "bad key".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.response_error(), None);
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        assert_eq!(rate_limited().retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(BackendError::Timeout { provider: "x".into() }.retry_after(), None);
    }

    #[test]
    fn test_response_error_serializes_snake_case() {
        let json = serde_json::to_string(&ResponseError::OutOfRange).unwrap();
        assert_eq!(json, "\"out_of_range\"");
        assert_eq!(ResponseError::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn test_parse_error_maps_to_response_error() {
        assert_eq!(ResponseError::from(ParseError::Unparseable), ResponseError::Unparseable);
        assert_eq!(
            ResponseError::from(ParseError::OutOfRange { value: 9, min: 1, max: 5 }),
            ResponseError::OutOfRange
        );
    }
}
