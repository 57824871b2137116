//! Psychological instruments: scales → subscales → ordered questions.
//!
//! Instruments are loaded once from `instruments.json`, validated, and
//! shared read-only for the rest of the run.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::simulation::parser::integer_tokens;

/// Default Likert range used when a description carries no usable bounds.
pub const DEFAULT_SCALE_MIN: i64 = 1;
pub const DEFAULT_SCALE_MAX: i64 = 5;

// ---------------------------------------------------------------------------
// Response scale
// ---------------------------------------------------------------------------

/// The closed integer range a question is answered on, with optional anchor
/// labels keyed by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseScale {
    pub min: i64,
    pub max: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<i64, String>,
}

impl Default for ResponseScale {
    fn default() -> Self {
        Self::likert(DEFAULT_SCALE_MIN, DEFAULT_SCALE_MAX)
    }
}

impl ResponseScale {
    pub fn likert(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            labels: BTreeMap::new(),
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// Parse a free-text description such as
    /// `"Rate from 1 (strongly disagree) to 5 (strongly agree)"` or
    /// `"1-5 scale"`.
    ///
    /// The first two integers become the bounds; a parenthesised phrase
    /// directly after an integer becomes that value's label. Descriptions
    /// without two integers fall back to the default 1–5 range.
    pub fn parse_description(text: &str) -> Self {
        let tokens: Vec<_> = integer_tokens(text).collect();
        if tokens.len() < 2 {
            return Self::default();
        }
        let (a, b) = (tokens[0].value, tokens[1].value);
        let mut scale = Self::likert(a.min(b), a.max(b));

        for token in &tokens {
            let rest = text[token.end..].trim_start();
            if let Some(inner) = rest.strip_prefix('(') {
                if let Some(close) = inner.find(')') {
                    let label = inner[..close].trim();
                    if !label.is_empty() && scale.contains(token.value) {
                        scale.labels.insert(token.value, label.to_string());
                    }
                }
            }
        }
        scale
    }

    /// Human-readable description used in prompts, e.g.
    /// `"1 (strongly disagree) to 5 (strongly agree)"`.
    pub fn describe(&self) -> String {
        let anchor = |value: i64| match self.labels.get(&value) {
            Some(label) => format!("{} ({})", value, label),
            None => value.to_string(),
        };
        format!("{} to {}", anchor(self.min), anchor(self.max))
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub response_scale: ResponseScale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscale {
    pub name: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    pub name: String,
    pub subscales: Vec<Subscale>,
}

impl Scale {
    pub fn question_count(&self) -> usize {
        self.subscales.iter().map(|s| s.questions.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub scales: Vec<Scale>,
}

/// A question together with the scale and subscale it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct QuestionRef<'a> {
    pub scale: &'a Scale,
    pub subscale: &'a Subscale,
    pub question: &'a Question,
}

impl Instrument {
    /// All questions in declaration order.
    pub fn questions(&self) -> impl Iterator<Item = QuestionRef<'_>> {
        self.scales.iter().flat_map(|scale| {
            scale.subscales.iter().flat_map(move |subscale| {
                subscale.questions.iter().map(move |question| QuestionRef {
                    scale,
                    subscale,
                    question,
                })
            })
        })
    }

    pub fn question_count(&self) -> usize {
        self.scales.iter().map(Scale::question_count).sum()
    }

    /// Check the structural invariants of a single instrument.
    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |message: String| StoreError::InvalidInstrument {
            instrument: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("instrument name is empty".into()));
        }
        let mut ids = HashSet::new();
        for scale in &self.scales {
            if scale.name.trim().is_empty() {
                return Err(invalid("scale with empty name".into()));
            }
            for subscale in &scale.subscales {
                if subscale.name.trim().is_empty() {
                    return Err(invalid(format!("empty subscale name in '{}'", scale.name)));
                }
                for question in &subscale.questions {
                    let rs = &question.response_scale;
                    if rs.min >= rs.max {
                        return Err(invalid(format!(
                            "question '{}' has empty range {}..={}",
                            question.id, rs.min, rs.max
                        )));
                    }
                    if !ids.insert(question.id.as_str()) {
                        return Err(StoreError::DuplicateQuestion {
                            instrument: self.name.clone(),
                            question_id: question.id.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// On-disk shape of `instruments.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentFile {
    pub instruments: Vec<Instrument>,
}

/// Validated, read-only instrument collection.
#[derive(Debug, Clone, Default)]
pub struct InstrumentStore {
    instruments: Vec<Instrument>,
}

impl InstrumentStore {
    /// Validate every instrument and require scale names to be unique
    /// across the store, since results are keyed by scale name.
    pub fn new(instruments: Vec<Instrument>) -> Result<Self, StoreError> {
        let mut scales = HashSet::new();
        for instrument in &instruments {
            instrument.validate()?;
            for scale in &instrument.scales {
                if !scales.insert(scale.name.as_str()) {
                    return Err(StoreError::DuplicateScale {
                        scale: scale.name.clone(),
                    });
                }
            }
        }
        Ok(Self { instruments })
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: InstrumentFile =
            serde_json::from_str(&raw).map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        let store = Self::new(file.instruments)?;
        tracing::info!(
            instruments = store.len(),
            questions = store.question_count(),
            path = %path.display(),
            "loaded instruments"
        );
        Ok(store)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.iter()
    }

    pub fn as_slice(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn question_count(&self) -> usize {
        self.instruments.iter().map(Instrument::question_count).sum()
    }

    /// Every question across all instruments, in declaration order.
    pub fn questions(&self) -> impl Iterator<Item = QuestionRef<'_>> {
        self.instruments.iter().flat_map(Instrument::questions)
    }

    pub fn to_file(&self) -> InstrumentFile {
        InstrumentFile {
            instruments: self.instruments.clone(),
        }
    }
}
