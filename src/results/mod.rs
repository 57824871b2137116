//! Simulation results.
//!
//! Per-question outcomes are produced as [`ResponseRecord`]s and folded into
//! a [`ResultMap`], the nested structure written as the run's JSON output:
//!
//! ```text
//! "{persona_id}_{model}" -> {
//!     persona_id, model,
//!     responses: condition_N -> scale -> subscale -> question_id -> value | null,
//!     errors:    condition_N -> [ {scale, subscale, question_id, error} ],
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::errors::{ResponseError, StoreError};
use crate::instrument::QuestionRef;

// ---------------------------------------------------------------------------
// ResponseRecord
// ---------------------------------------------------------------------------

/// Outcome of one question in one cell. Exactly one of `value` and `error`
/// is set; the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    pub persona_id: u64,
    pub model: String,
    pub condition: Condition,
    pub scale: String,
    pub subscale: String,
    pub question_id: String,
    value: Option<i64>,
    error: Option<ResponseError>,
}

impl ResponseRecord {
    pub fn answered(cell: &CellKey, question: &QuestionRef<'_>, value: i64) -> Self {
        Self::build(cell, question, Some(value), None)
    }

    pub fn failed(cell: &CellKey, question: &QuestionRef<'_>, error: ResponseError) -> Self {
        Self::build(cell, question, None, Some(error))
    }

    fn build(
        cell: &CellKey,
        question: &QuestionRef<'_>,
        value: Option<i64>,
        error: Option<ResponseError>,
    ) -> Self {
        Self {
            persona_id: cell.persona_id,
            model: cell.model.clone(),
            condition: cell.condition,
            scale: question.scale.name.clone(),
            subscale: question.subscale.name.clone(),
            question_id: question.question.id.clone(),
            value,
            error,
        }
    }

    pub fn value(&self) -> Option<i64> {
        self.value
    }

    pub fn error(&self) -> Option<ResponseError> {
        self.error
    }
}

/// Identity of a (persona, model, condition) cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub persona_id: u64,
    pub model: String,
    pub condition: Condition,
}

impl CellKey {
    pub fn new(persona_id: u64, model: impl Into<String>, condition: Condition) -> Self {
        Self {
            persona_id,
            model: model.into(),
            condition,
        }
    }

    /// `"{persona_id}_{model}"`, the top-level result map key.
    pub fn persona_key(&self) -> String {
        persona_key(self.persona_id, &self.model)
    }
}

pub fn persona_key(persona_id: u64, model: &str) -> String {
    format!("{}_{}", persona_id, model)
}

// ---------------------------------------------------------------------------
// ResultMap
// ---------------------------------------------------------------------------

/// subscale -> question_id -> value
pub type SubscaleValues = BTreeMap<String, BTreeMap<String, Option<i64>>>;
/// scale -> subscale -> question_id -> value
pub type ScaleValues = BTreeMap<String, SubscaleValues>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionError {
    pub scale: String,
    pub subscale: String,
    pub question_id: String,
    pub error: ResponseError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub persona_id: u64,
    pub model: String,
    /// condition_N -> scale -> subscale -> question_id -> value
    #[serde(default)]
    pub responses: BTreeMap<String, ScaleValues>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, Vec<QuestionError>>,
}

impl ResultEntry {
    pub fn new(persona_id: u64, model: impl Into<String>) -> Self {
        Self {
            persona_id,
            model: model.into(),
            responses: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    /// Recorded value for a question, `None` when absent or null.
    pub fn value(&self, condition: Condition, scale: &str, subscale: &str, question_id: &str) -> Option<i64> {
        self.responses
            .get(&condition.key())?
            .get(scale)?
            .get(subscale)?
            .get(question_id)
            .copied()
            .flatten()
    }

    /// Whether the question has an entry (value or null) under `condition`.
    pub fn contains(&self, condition: Condition, scale: &str, subscale: &str, question_id: &str) -> bool {
        self.responses
            .get(&condition.key())
            .and_then(|s| s.get(scale))
            .and_then(|s| s.get(subscale))
            .is_some_and(|q| q.contains_key(question_id))
    }

    /// Recorded error for a question. Ids are only unique within a scale.
    pub fn error(&self, condition: Condition, scale: &str, question_id: &str) -> Option<ResponseError> {
        self.errors
            .get(&condition.key())?
            .iter()
            .find(|e| e.scale == scale && e.question_id == question_id)
            .map(|e| e.error)
    }
}

/// Nested results of a run, keyed by `"{persona_id}_{model}"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultMap {
    entries: BTreeMap<String, ResultEntry>,
}

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record in. A later record for the same question replaces
    /// the earlier one.
    pub fn insert(&mut self, record: &ResponseRecord) {
        let key = persona_key(record.persona_id, &record.model);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| ResultEntry::new(record.persona_id, record.model.clone()));
        let condition = record.condition.key();

        entry
            .responses
            .entry(condition.clone())
            .or_default()
            .entry(record.scale.clone())
            .or_default()
            .entry(record.subscale.clone())
            .or_default()
            .insert(record.question_id.clone(), record.value);

        let errors = entry.errors.entry(condition.clone()).or_default();
        errors.retain(|e| e.question_id != record.question_id || e.scale != record.scale);
        if let Some(error) = record.error {
            errors.push(QuestionError {
                scale: record.scale.clone(),
                subscale: record.subscale.clone(),
                question_id: record.question_id.clone(),
                error,
            });
        }
        if errors.is_empty() {
            entry.errors.remove(&condition);
        }
    }

    pub fn extend<'a>(&mut self, records: impl IntoIterator<Item = &'a ResponseRecord>) {
        for record in records {
            self.insert(record);
        }
    }

    /// Ensure an entry exists even if none of its cells produced records,
    /// so the summary can count it as missing.
    pub fn ensure_entry(&mut self, persona_id: u64, model: &str) {
        self.entries
            .entry(persona_key(persona_id, model))
            .or_insert_with(|| ResultEntry::new(persona_id, model));
    }

    pub fn get(&self, persona_id: u64, model: &str) -> Option<&ResultEntry> {
        self.entries.get(&persona_key(persona_id, model))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &ResultEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check the structural invariants of a map read from disk: keys match
    /// their entries, errored questions are null, condition keys are known.
    pub fn validate(&self) -> Result<(), String> {
        for (key, entry) in &self.entries {
            if *key != persona_key(entry.persona_id, &entry.model) {
                return Err(format!(
                    "key '{}' does not match persona {} / model '{}'",
                    key, entry.persona_id, entry.model
                ));
            }
            for condition in entry.responses.keys().chain(entry.errors.keys()) {
                if Condition::from_key(condition).is_none() {
                    return Err(format!("'{}': unknown condition '{}'", key, condition));
                }
            }
            for (condition, errors) in &entry.errors {
                for e in errors {
                    let value = entry
                        .responses
                        .get(condition)
                        .and_then(|s| s.get(&e.scale))
                        .and_then(|s| s.get(&e.subscale))
                        .and_then(|q| q.get(&e.question_id));
                    if let Some(Some(v)) = value {
                        return Err(format!(
                            "'{}' {} {}: has both value {} and error {}",
                            key, condition, e.question_id, v, e.error
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }
}
