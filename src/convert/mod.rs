//! Conversion of the raw tabular inputs into `personas.json` and
//! `instruments.json`.
//!
//! Both stages are single-pass and idempotent: an existing output is left
//! untouched unless `force` is set.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::errors::ConvertError;
use crate::instrument::{Instrument, InstrumentFile, InstrumentStore, Question, ResponseScale, Scale, Subscale};
use crate::persona::{Persona, PersonaFile, PersonaStore, PriorResponse};

/// Subscale used for items listed without one.
pub const DEFAULT_SUBSCALE: &str = "items";

/// Result of a conversion stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// The output was written with this many top-level records.
    Written(usize),
    /// The output already existed.
    Skipped,
}

// ---------------------------------------------------------------------------
// Shared CSV helpers
// ---------------------------------------------------------------------------

/// Header lookup, case-insensitive and tolerant of surrounding whitespace.
struct Header {
    index: HashMap<String, usize>,
    names: Vec<String>,
}

impl Header {
    fn read(reader: &mut csv::Reader<std::fs::File>, path: &Path) -> Result<Self, ConvertError> {
        let names: Vec<String> = reader
            .headers()
            .map_err(|source| ConvertError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_lowercase(), i))
            .collect();
        Ok(Self { index, names })
    }

    fn optional(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|a| self.index.get(*a).copied())
    }

    fn require(&self, column: &str, path: &Path) -> Result<usize, ConvertError> {
        self.optional(&[column]).ok_or_else(|| ConvertError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
        })
    }
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, ConvertError> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|source| ConvertError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

/// Trimmed, non-empty cell.
fn cell(record: &csv::StringRecord, index: Option<usize>) -> Option<&str> {
    index
        .and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), ConvertError> {
    let write_err = |source| ConvertError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| ConvertError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(write_err)
}

fn skip_existing(output: &Path, force: bool) -> bool {
    if output.exists() && !force {
        tracing::info!(path = %output.display(), "output already exists, skipping conversion");
        return true;
    }
    false
}

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

const PERSONA_COLUMNS: [&str; 4] = ["persona", "instruction", "original", "data"];

fn demographic_value(raw: &str) -> Value {
    raw.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(raw))
}

/// Read the persona table.
///
/// Rows are grouped by the `persona` column in order of first appearance.
/// When every label is an integer the labels become the ids; otherwise ids
/// are assigned sequentially from 1 and the label is kept as the name.
/// Columns other than the four fixed ones are demographics; the first
/// non-empty value per persona wins.
pub fn read_personas(path: &Path) -> Result<Vec<Persona>, ConvertError> {
    let mut reader = open(path)?;
    let header = Header::read(&mut reader, path)?;
    let persona_col = header.require("persona", path)?;
    let original_col = header.require("original", path)?;
    let data_col = header.require("data", path)?;
    let instruction_col = header.optional(&["instruction"]);
    let demographic_cols: Vec<(usize, &str)> = header
        .names
        .iter()
        .enumerate()
        .filter(|(_, name)| !PERSONA_COLUMNS.contains(&name.to_lowercase().as_str()))
        .map(|(i, name)| (i, name.as_str()))
        .collect();

    let mut labels: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Persona> = HashMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|source| ConvertError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(label) = cell(&record, Some(persona_col)) else {
            tracing::warn!(row = row + 1, "row without persona label, skipping");
            continue;
        };

        let persona = grouped.entry(label.to_string()).or_insert_with(|| {
            labels.push(label.to_string());
            Persona::new(0)
        });
        for &(i, name) in &demographic_cols {
            if let Some(value) = cell(&record, Some(i)) {
                persona
                    .demographics
                    .entry(name.to_string())
                    .or_insert_with(|| demographic_value(value));
            }
        }
        let question_id = persona.prior_responses.len() as u32 + 1;
        persona.prior_responses.push(PriorResponse {
            question_id,
            instruction: cell(&record, instruction_col).map(str::to_string),
            original_response: cell(&record, Some(original_col)).map(str::to_string),
            revised_response: cell(&record, Some(data_col)).map(str::to_string),
        });
    }

    let numeric: Option<Vec<u64>> = labels.iter().map(|l| l.parse().ok()).collect();
    let mut personas = Vec::with_capacity(labels.len());
    for (position, label) in labels.iter().enumerate() {
        let Some(mut persona) = grouped.remove(label) else {
            continue;
        };
        match &numeric {
            Some(ids) => persona.persona_id = ids[position],
            None => {
                persona.persona_id = position as u64 + 1;
                persona.name = Some(label.clone());
            }
        }
        personas.push(persona);
    }
    Ok(personas)
}

/// `persona CSV -> personas.json`.
pub fn convert_personas(input: &Path, output: &Path, force: bool) -> Result<ConvertOutcome, ConvertError> {
    if skip_existing(output, force) {
        return Ok(ConvertOutcome::Skipped);
    }
    tracing::info!(path = %input.display(), "loading personas");
    let store = PersonaStore::new(read_personas(input)?)?;
    let file: PersonaFile = store.to_file();
    write_json(&file, output)?;
    tracing::info!(count = store.len(), path = %output.display(), "wrote personas");
    Ok(ConvertOutcome::Written(store.len()))
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Read the instrument table into a single instrument named `name`.
///
/// Scales and subscales keep first-appearance order. A row's own response
/// scale description wins; otherwise the description last given on a
/// subscale-less row of the same scale applies; otherwise 1–5.
pub fn read_instrument(path: &Path, name: &str) -> Result<Instrument, ConvertError> {
    let mut reader = open(path)?;
    let header = Header::read(&mut reader, path)?;
    let number_col = header.require("number", path)?;
    let item_col = header.require("item", path)?;
    let scale_col = header.require("scale", path)?;
    let subscale_col = header.optional(&["subscale"]);
    let response_col = header.optional(&["response scale", "response_scale"]);

    let mut scales: Vec<Scale> = Vec::new();
    let mut scale_defaults: HashMap<String, ResponseScale> = HashMap::new();
    let mut seen: HashMap<String, String> = HashMap::new();

    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|source| ConvertError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let (Some(number), Some(item), Some(scale_name)) = (
            cell(&record, Some(number_col)),
            cell(&record, Some(item_col)),
            cell(&record, Some(scale_col)),
        ) else {
            tracing::warn!(row = row + 1, "incomplete instrument row, skipping");
            continue;
        };
        let subscale_name = cell(&record, subscale_col);
        let description = cell(&record, response_col).map(ResponseScale::parse_description);

        if let Some(previous) = seen.insert(number.to_string(), scale_name.to_string()) {
            return Err(ConvertError::DuplicateQuestion {
                path: path.to_path_buf(),
                number: number.to_string(),
                scale: previous,
            });
        }
        if subscale_name.is_none() {
            if let Some(rs) = &description {
                scale_defaults.insert(scale_name.to_string(), rs.clone());
            }
        }
        let response_scale = description
            .or_else(|| scale_defaults.get(scale_name).cloned())
            .unwrap_or_default();

        let scale_index = match scales.iter().position(|s| s.name == scale_name) {
            Some(i) => i,
            None => {
                scales.push(Scale {
                    name: scale_name.to_string(),
                    subscales: Vec::new(),
                });
                scales.len() - 1
            }
        };
        let scale = &mut scales[scale_index];
        let subscale_name = subscale_name.unwrap_or(DEFAULT_SUBSCALE);
        let subscale_index = match scale.subscales.iter().position(|s| s.name == subscale_name) {
            Some(i) => i,
            None => {
                scale.subscales.push(Subscale {
                    name: subscale_name.to_string(),
                    questions: Vec::new(),
                });
                scale.subscales.len() - 1
            }
        };
        scale.subscales[subscale_index].questions.push(Question {
            id: number.to_string(),
            text: item.to_string(),
            response_scale,
        });
    }

    Ok(Instrument {
        name: name.to_string(),
        scales,
    })
}

/// `instrument CSV -> instruments.json`. The instrument is named after the
/// input file stem.
pub fn convert_instruments(input: &Path, output: &Path, force: bool) -> Result<ConvertOutcome, ConvertError> {
    if skip_existing(output, force) {
        return Ok(ConvertOutcome::Skipped);
    }
    let name = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "instruments".to_string());
    tracing::info!(path = %input.display(), "loading instruments");
    let store = InstrumentStore::new(vec![read_instrument(input, &name)?])?;
    let file: InstrumentFile = store.to_file();
    write_json(&file, output)?;
    tracing::info!(
        questions = store.question_count(),
        path = %output.display(),
        "wrote instruments"
    );
    Ok(ConvertOutcome::Written(store.question_count()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    const PERSONAS: &str = "\
persona,instruction,original,data,age,gender
1,Favourite colour?,Blue,I prefer blue colors,25,female
1,Hobby?,Reading,I love reading,,
2,Favourite colour?,Red,Red is bold,40,male
";

    #[test]
    fn test_personas_grouped_by_label() {
        let dir = tempfile::tempdir().unwrap();
        let personas = read_personas(&write(&dir, "p.csv", PERSONAS)).unwrap();
        assert_eq!(personas.len(), 2);

        let first = &personas[0];
        assert_eq!(first.persona_id, 1);
        assert_eq!(first.name, None);
        assert_eq!(first.demographics["age"], 25);
        assert_eq!(first.demographics["gender"], "female");
        assert_eq!(first.prior_responses.len(), 2);
        assert_eq!(first.prior_responses[1].question_id, 2);
        assert_eq!(first.prior_responses[1].instruction.as_deref(), Some("Hobby?"));
        assert_eq!(
            first.prior_responses[0].revised_response.as_deref(),
            Some("I prefer blue colors")
        );
        assert_eq!(personas[1].persona_id, 2);
    }

    #[test]
    fn test_non_numeric_labels_get_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let csv = "persona,original,data\nzoe,a,b\nadam,c,d\nzoe,e,f\n";
        let personas = read_personas(&write(&dir, "p.csv", csv)).unwrap();
        let ids: Vec<_> = personas.iter().map(|p| (p.persona_id, p.name.as_deref())).collect();
        assert_eq!(ids, vec![(1, Some("zoe")), (2, Some("adam"))]);
        assert_eq!(personas[0].prior_responses.len(), 2);
        assert_eq!(personas[0].prior_responses[0].instruction, None);
    }

    #[test]
    fn test_persona_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "p.csv", "persona,original\n1,a\n");
        assert!(matches!(
            read_personas(&path),
            Err(ConvertError::MissingColumn { column, .. }) if column == "data"
        ));
    }

    #[test]
    fn test_convert_personas_writes_loadable_file_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let input = write(&dir, "p.csv", PERSONAS);
        let output = dir.path().join("out/personas.json");

        assert_eq!(convert_personas(&input, &output, false).unwrap(), ConvertOutcome::Written(2));
        let store = PersonaStore::load(&output).unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(convert_personas(&input, &output, false).unwrap(), ConvertOutcome::Skipped);
        assert_eq!(convert_personas(&input, &output, true).unwrap(), ConvertOutcome::Written(2));
    }

    const INSTRUMENTS: &str = "\
number,item,subscale,scale,response scale
1,I am the life of the party,Extraversion,Big Five,Rate from 1 (strongly disagree) to 5 (strongly agree)
2,I sympathize with others,Agreeableness,Big Five,Rate from 1 (strongly disagree) to 5 (strongly agree)
3,I finish whatever I begin,,Grit,1-7 scale
4,Setbacks don't discourage me,,Grit,
5,I am talkative,Extraversion,Big Five,
";

    #[test]
    fn test_instrument_grouping() {
        let dir = tempfile::tempdir().unwrap();
        let instrument = read_instrument(&write(&dir, "i.csv", INSTRUMENTS), "battery").unwrap();
        assert_eq!(instrument.name, "battery");
        let scales: Vec<_> = instrument.scales.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(scales, vec!["Big Five", "Grit"]);

        let big_five = &instrument.scales[0];
        assert_eq!(big_five.subscales[0].name, "Extraversion");
        let ids: Vec<_> = big_five.subscales[0].questions.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "5"]);
        let rs = &big_five.subscales[0].questions[0].response_scale;
        assert_eq!((rs.min, rs.max), (1, 5));
        assert_eq!(rs.labels.get(&5).map(String::as_str), Some("strongly agree"));
        assert_eq!(big_five.subscales[0].questions[1].response_scale, ResponseScale::default());

        let grit = &instrument.scales[1];
        assert_eq!(grit.subscales.len(), 1);
        assert_eq!(grit.subscales[0].name, DEFAULT_SUBSCALE);
        for question in &grit.subscales[0].questions {
            assert_eq!((question.response_scale.min, question.response_scale.max), (1, 7));
        }
    }

    #[test]
    fn test_duplicate_question_number() {
        let dir = tempfile::tempdir().unwrap();
        let csv = "number,item,subscale,scale\n1,a,x,S\n1,b,y,T\n";
        assert!(matches!(
            read_instrument(&write(&dir, "i.csv", csv), "dup"),
            Err(ConvertError::DuplicateQuestion { number, .. }) if number == "1"
        ));
    }

    #[test]
    fn test_convert_instruments_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = write(&dir, "big_five.csv", INSTRUMENTS);
        let output = dir.path().join("instruments.json");
        assert_eq!(
            convert_instruments(&input, &output, false).unwrap(),
            ConvertOutcome::Written(5)
        );
        let store = InstrumentStore::load(&output).unwrap();
        assert_eq!(store.as_slice()[0].name, "big_five");
        assert_eq!(store.question_count(), 5);
    }
}
