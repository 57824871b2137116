//! Persona records and the read-only persona store.
//!
//! A persona is a synthetic respondent: an integer id, a bag of demographic
//! attributes and, optionally, the free-text responses it gave in the source
//! dataset. The store is loaded once from `personas.json` and shared
//! read-only with the simulation driver.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StoreError;

/// One response carried over from the source dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorResponse {
    /// 1-based position of the response within the persona's rows.
    pub question_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_response: Option<String>,
}

/// A synthetic respondent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    #[serde(rename = "id")]
    pub persona_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub demographics: BTreeMap<String, Value>,
    #[serde(rename = "responses", default, skip_serializing_if = "Vec::is_empty")]
    pub prior_responses: Vec<PriorResponse>,
}

impl Persona {
    pub fn new(persona_id: u64) -> Self {
        Self {
            persona_id,
            name: None,
            demographics: BTreeMap::new(),
            prior_responses: Vec::new(),
        }
    }

    /// Builder-style helper used by tests and the conversion stage.
    pub fn with_demographic(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.demographics.insert(key.into(), value.into());
        self
    }

    /// Required demographic fields that are absent or blank.
    pub fn missing_demographics<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|field| match self.demographics.get(field.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .map(String::as_str)
            .collect()
    }
}

/// On-disk shape of `personas.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaFile {
    pub personas: Vec<Persona>,
}

/// In-memory persona collection. Ids are unique.
#[derive(Debug, Clone, Default)]
pub struct PersonaStore {
    personas: Vec<Persona>,
}

impl PersonaStore {
    /// Build a store, rejecting duplicate ids.
    pub fn new(personas: Vec<Persona>) -> Result<Self, StoreError> {
        let mut seen = HashSet::with_capacity(personas.len());
        for persona in &personas {
            if !seen.insert(persona.persona_id) {
                return Err(StoreError::DuplicatePersona(persona.persona_id));
            }
        }
        Ok(Self { personas })
    }

    /// Load `personas.json`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PersonaFile = serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::new(file.personas)?;
        tracing::info!(count = store.len(), path = %path.display(), "loaded personas");
        Ok(store)
    }

    /// Log a warning for every persona missing a required demographic field.
    ///
    /// Returns the number of incomplete personas.
    pub fn warn_incomplete(&self, required: &[String]) -> usize {
        let mut incomplete = 0;
        for persona in &self.personas {
            let missing = persona.missing_demographics(required);
            if !missing.is_empty() {
                incomplete += 1;
                tracing::warn!(
                    persona_id = persona.persona_id,
                    missing = ?missing,
                    "persona is missing demographic fields"
                );
            }
        }
        incomplete
    }

    pub fn get(&self, persona_id: u64) -> Option<&Persona> {
        self.personas.iter().find(|p| p.persona_id == persona_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    pub fn as_slice(&self) -> &[Persona] {
        &self.personas
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn to_file(&self) -> PersonaFile {
        PersonaFile {
            personas: self.personas.clone(),
        }
    }
}
