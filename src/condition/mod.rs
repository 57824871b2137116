//! Context-management conditions and the turn plans they produce.
//!
//! | Condition | Turns | Reset |
//! |-----------|-------|-------|
//! | 1, question-level | one per question | before every turn |
//! | 2, scale-level | one per scale | before every turn |
//! | 3, full-context | one for the instrument, scales and subscales shuffled | never |

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::instrument::{Instrument, QuestionRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[serde(alias = "condition_1")]
    QuestionLevel,
    #[serde(alias = "condition_2")]
    ScaleLevel,
    #[serde(alias = "condition_3")]
    FullContext,
}

impl Condition {
    pub const ALL: [Condition; 3] = [Self::QuestionLevel, Self::ScaleLevel, Self::FullContext];

    pub fn number(&self) -> u8 {
        match self {
            Self::QuestionLevel => 1,
            Self::ScaleLevel => 2,
            Self::FullContext => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.number() == n)
    }

    /// Key used in the result map and CSV file names, e.g. `condition_2`.
    pub fn key(&self) -> String {
        format!("condition_{}", self.number())
    }

    pub fn from_key(key: &str) -> Option<Self> {
        key.strip_prefix("condition_")
            .and_then(|n| n.parse().ok())
            .and_then(Self::from_number)
    }

    /// Produce the ordered turns for one (persona, model, instrument) cell.
    ///
    /// `seed` only affects `FullContext`.
    pub fn plan<'a>(&self, instrument: &'a Instrument, seed: u64) -> Vec<Turn<'a>> {
        match self {
            Self::QuestionLevel => instrument
                .questions()
                .map(|q| Turn {
                    reset: true,
                    questions: vec![q],
                })
                .collect(),
            Self::ScaleLevel => instrument
                .scales
                .iter()
                .map(|scale| Turn {
                    reset: true,
                    questions: scale
                        .subscales
                        .iter()
                        .flat_map(|subscale| {
                            subscale.questions.iter().map(move |question| QuestionRef {
                                scale,
                                subscale,
                                question,
                            })
                        })
                        .collect(),
                })
                .collect(),
            Self::FullContext => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut scales: Vec<_> = instrument.scales.iter().collect();
                scales.shuffle(&mut rng);

                let mut questions = Vec::with_capacity(instrument.question_count());
                for scale in scales {
                    let mut subscales: Vec<_> = scale.subscales.iter().collect();
                    subscales.shuffle(&mut rng);
                    for subscale in subscales {
                        questions.extend(subscale.questions.iter().map(|question| QuestionRef {
                            scale,
                            subscale,
                            question,
                        }));
                    }
                }
                vec![Turn {
                    reset: true,
                    questions,
                }]
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "condition_{}", self.number())
    }
}

impl FromStr for Condition {
    type Err = String;

    /// Accepts `1`, `condition_1` or `question_level` style names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(c) = s.parse::<u8>().ok().and_then(Self::from_number) {
            return Ok(c);
        }
        if let Some(c) = Self::from_key(s) {
            return Ok(c);
        }
        match s {
            "question_level" => Ok(Self::QuestionLevel),
            "scale_level" => Ok(Self::ScaleLevel),
            "full_context" => Ok(Self::FullContext),
            other => Err(format!("unknown condition '{}'", other)),
        }
    }
}

/// One request/response exchange.
///
/// `reset` is true when the turn must start from a fresh conversation. The
/// first turn of every plan resets, since each cell owns a new conversation.
#[derive(Debug, Clone)]
pub struct Turn<'a> {
    pub reset: bool,
    pub questions: Vec<QuestionRef<'a>>,
}

/// 64-bit FNV-1a over `parts`, with a separator byte between parts so that
/// `["ab", "c"]` and `["a", "bc"]` hash differently.
pub(crate) fn fnv1a(parts: &[&[u8]]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hash ^= 0xff;
            hash = hash.wrapping_mul(PRIME);
        }
        for byte in part.iter() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// Derive the per-cell ordering seed from the run seed.
///
/// Stable across platforms and compiler versions.
pub fn derive_seed(base: u64, persona_id: u64, model: &str, instrument: &str) -> u64 {
    fnv1a(&[
        &base.to_le_bytes(),
        &persona_id.to_le_bytes(),
        model.as_bytes(),
        instrument.as_bytes(),
    ])
}
