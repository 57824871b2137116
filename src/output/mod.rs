//! Flattening of the result map into analysis tables.
//!
//! - `condition_N.csv`: one row per (persona, model) with columns
//!   `persona_id, model, condition` followed by one `{Scale}_{Subscale}_{QuestionID}`
//!   column per question in instrument order. Null values are empty cells.
//! - `summary.json` / `summary.csv`: expected, filled, errored and missing
//!   cells per condition and model.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::errors::{ExportError, ResponseError};
use crate::instrument::InstrumentStore;
use crate::results::{ResultEntry, ResultMap};

const FIXED_COLUMNS: [&str; 3] = ["persona_id", "model", "condition"];

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

/// One question column of a condition table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Column {
    pub scale: String,
    pub subscale: String,
    pub question_id: String,
}

impl Column {
    pub fn header(&self) -> String {
        format!("{}_{}_{}", self.scale, self.subscale, self.question_id)
    }
}

fn question_columns(instruments: &InstrumentStore) -> Vec<Column> {
    instruments
        .questions()
        .map(|q| Column {
            scale: q.scale.name.clone(),
            subscale: q.subscale.name.clone(),
            question_id: q.question.id.clone(),
        })
        .collect()
}

/// Question columns in instrument declaration order.
///
/// Fails when two questions share a header, e.g. scale `A_B` with subscale
/// `C` and scale `A` with subscale `B_C`.
pub fn columns(instruments: &InstrumentStore) -> Result<Vec<Column>, ExportError> {
    let columns = question_columns(instruments);
    let mut seen = HashSet::new();
    for column in &columns {
        let header = column.header();
        if !seen.insert(header.clone()) {
            return Err(ExportError::DuplicateColumn { column: header });
        }
    }
    Ok(columns)
}

pub fn condition_file_name(condition: Condition) -> String {
    format!("{}.csv", condition.key())
}

fn csv_err(path: &Path) -> impl Fn(csv::Error) -> ExportError + '_ {
    move |source| ExportError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Entries ordered by persona id, then model.
fn sorted_entries(results: &ResultMap) -> Vec<&ResultEntry> {
    let mut entries: Vec<_> = results.entries().map(|(_, e)| e).collect();
    entries.sort_by(|a, b| (a.persona_id, &a.model).cmp(&(b.persona_id, &b.model)));
    entries
}

// ---------------------------------------------------------------------------
// Condition tables
// ---------------------------------------------------------------------------

/// Write one condition table. Returns the number of data rows.
pub fn write_condition_csv(
    results: &ResultMap,
    instruments: &InstrumentStore,
    condition: Condition,
    path: &Path,
) -> Result<usize, ExportError> {
    let columns = columns(instruments)?;
    let mut writer = csv::Writer::from_path(path).map_err(csv_err(path))?;

    let header = FIXED_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(columns.iter().map(Column::header));
    writer.write_record(header).map_err(csv_err(path))?;

    let key = condition.key();
    let mut rows = 0;
    for entry in sorted_entries(results) {
        let mut record = vec![entry.persona_id.to_string(), entry.model.clone(), key.clone()];
        record.extend(columns.iter().map(|c| {
            entry
                .value(condition, &c.scale, &c.subscale, &c.question_id)
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record).map_err(csv_err(path))?;
        rows += 1;
    }
    writer.flush().map_err(io_err(path))?;
    Ok(rows)
}

/// A row read back from a condition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
    pub persona_id: u64,
    pub model: String,
    pub condition: Condition,
    pub values: BTreeMap<Column, Option<i64>>,
}

/// Read a condition table, mapping headers back to questions through the
/// instrument definitions.
pub fn read_condition_csv(path: &Path, instruments: &InstrumentStore) -> Result<Vec<CsvRow>, ExportError> {
    let by_header: HashMap<String, Column> = columns(instruments)?
        .into_iter()
        .map(|c| (c.header(), c))
        .collect();

    let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
    let headers = reader.headers().map_err(csv_err(path))?.clone();

    for (i, expected) in FIXED_COLUMNS.iter().enumerate() {
        if headers.get(i) != Some(*expected) {
            return Err(ExportError::UnknownColumn {
                path: path.to_path_buf(),
                column: headers.get(i).unwrap_or_default().to_string(),
            });
        }
    }
    let question_columns = headers
        .iter()
        .skip(FIXED_COLUMNS.len())
        .map(|h| {
            by_header.get(h).cloned().ok_or_else(|| ExportError::UnknownColumn {
                path: path.to_path_buf(),
                column: h.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let invalid = |column: &str, value: &str| ExportError::InvalidValue {
        path: path.to_path_buf(),
        column: column.to_string(),
        value: value.to_string(),
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err(path))?;
        let field = |i: usize| record.get(i).unwrap_or_default();

        let persona_id = field(0)
            .parse::<u64>()
            .map_err(|_| invalid("persona_id", field(0)))?;
        let condition = Condition::from_key(field(2)).ok_or_else(|| invalid("condition", field(2)))?;

        let mut values = BTreeMap::new();
        for (offset, column) in question_columns.iter().enumerate() {
            let raw = field(FIXED_COLUMNS.len() + offset).trim();
            let value = if raw.is_empty() {
                None
            } else {
                Some(raw.parse::<i64>().map_err(|_| invalid(&column.header(), raw))?)
            };
            values.insert(column.clone(), value);
        }

        rows.push(CsvRow {
            persona_id,
            model: field(1).to_string(),
            condition,
            values,
        });
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSummary {
    pub condition: String,
    pub model: String,
    pub expected: usize,
    pub filled: usize,
    pub errors: BTreeMap<ResponseError, usize>,
    /// Expected cells with neither a value nor an error, e.g. after cancellation.
    pub missing: usize,
}

impl ConditionSummary {
    pub fn error_total(&self) -> usize {
        self.errors.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<ConditionSummary>,
}

/// Completeness and validity counts per condition and model.
pub fn summarize(results: &ResultMap, instruments: &InstrumentStore, conditions: &[Condition]) -> Summary {
    let columns = question_columns(instruments);
    let mut by_model: BTreeMap<&str, Vec<&ResultEntry>> = BTreeMap::new();
    for (_, entry) in results.entries() {
        by_model.entry(entry.model.as_str()).or_default().push(entry);
    }

    let mut rows = Vec::new();
    for &condition in conditions {
        let key = condition.key();
        for (model, entries) in &by_model {
            let expected = entries.len() * columns.len();
            let mut filled = 0;
            let mut errors: BTreeMap<ResponseError, usize> = BTreeMap::new();
            for entry in entries {
                filled += columns
                    .iter()
                    .filter(|c| entry.value(condition, &c.scale, &c.subscale, &c.question_id).is_some())
                    .count();
                for e in entry.errors.get(&key).into_iter().flatten() {
                    *errors.entry(e.error).or_default() += 1;
                }
            }
            let errored: usize = errors.values().sum();
            rows.push(ConditionSummary {
                condition: key.clone(),
                model: model.to_string(),
                expected,
                filled,
                errors,
                missing: expected.saturating_sub(filled + errored),
            });
        }
    }

    Summary {
        generated_at: Utc::now(),
        rows,
    }
}

fn write_summary_csv(summary: &Summary, path: &Path) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err(path))?;
    let header = ["condition", "model", "expected", "filled", "missing"]
        .into_iter()
        .chain(ResponseError::ALL.iter().map(ResponseError::as_str));
    writer.write_record(header).map_err(csv_err(path))?;

    for row in &summary.rows {
        let record = [
            row.condition.clone(),
            row.model.clone(),
            row.expected.to_string(),
            row.filled.to_string(),
            row.missing.to_string(),
        ]
        .into_iter()
        .chain(
            ResponseError::ALL
                .iter()
                .map(|kind| row.errors.get(kind).copied().unwrap_or(0).to_string()),
        );
        writer.write_record(record).map_err(csv_err(path))?;
    }
    writer.flush().map_err(io_err(path))
}

/// Files produced by [`export`].
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub files: Vec<PathBuf>,
    pub summary: Summary,
}

/// Write one table per condition plus the summary files into `out_dir`.
pub fn export(
    results: &ResultMap,
    instruments: &InstrumentStore,
    conditions: &[Condition],
    out_dir: &Path,
) -> Result<ExportReport, ExportError> {
    std::fs::create_dir_all(out_dir).map_err(io_err(out_dir))?;

    let mut files = Vec::new();
    for &condition in conditions {
        let path = out_dir.join(condition_file_name(condition));
        let rows = write_condition_csv(results, instruments, condition, &path)?;
        tracing::info!(%condition, rows, path = %path.display(), "wrote condition table");
        files.push(path);
    }

    let summary = summarize(results, instruments, conditions);
    for row in &summary.rows {
        tracing::info!(
            condition = %row.condition,
            model = %row.model,
            expected = row.expected,
            filled = row.filled,
            errors = row.error_total(),
            missing = row.missing,
            "summary"
        );
    }

    let json_path = out_dir.join("summary.json");
    let json = serde_json::to_string_pretty(&summary).map_err(|source| ExportError::Json {
        path: json_path.clone(),
        source,
    })?;
    std::fs::write(&json_path, json).map_err(io_err(&json_path))?;
    files.push(json_path);

    let csv_path = out_dir.join("summary.csv");
    write_summary_csv(&summary, &csv_path)?;
    files.push(csv_path);

    Ok(ExportReport { files, summary })
}

/// Re-read a result map file, check its shape and rewrite it pretty-printed.
pub fn format_results(path: &Path) -> Result<ResultMap, ExportError> {
    let results = ResultMap::load(path)?;
    results.validate().map_err(|message| ExportError::InvalidResults {
        path: path.to_path_buf(),
        message,
    })?;
    results.save(path)?;
    tracing::info!(entries = results.len(), path = %path.display(), "formatted results");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::fixtures::{battery, big_five};
    use crate::results::{CellKey, ResponseRecord};

    fn store() -> InstrumentStore {
        InstrumentStore::new(vec![big_five()]).unwrap()
    }

    /// Persona 1 answered both questions, persona 2 answered Q1 and failed
    /// to parse Q2, persona 3 never ran.
    fn results() -> ResultMap {
        let instrument = big_five();
        let qs: Vec<_> = instrument.questions().collect();
        let mut map = ResultMap::new();
        let c1 = CellKey::new(1, "gpt-4", Condition::QuestionLevel);
        map.insert(&ResponseRecord::answered(&c1, &qs[0], 4));
        map.insert(&ResponseRecord::answered(&c1, &qs[1], 3));
        let c2 = CellKey::new(2, "gpt-4", Condition::QuestionLevel);
        map.insert(&ResponseRecord::answered(&c2, &qs[0], 5));
        map.insert(&ResponseRecord::failed(&c2, &qs[1], ResponseError::Unparseable));
        map.ensure_entry(3, "gpt-4");
        map
    }

    #[test]
    fn test_column_headers_follow_instrument_order() {
        let store = InstrumentStore::new(vec![battery()]).unwrap();
        let headers: Vec<_> = columns(&store).unwrap().iter().map(Column::header).collect();
        assert_eq!(headers.len(), 12);
        assert_eq!(headers[0], "Big Five_Big Five A_Q1");
        assert_eq!(headers[11], "Need for Cognition_Need for Cognition B_Q12");
    }

    #[test]
    fn test_colliding_headers_are_rejected() {
        use crate::instrument::fixtures::subscale;
        use crate::instrument::{Instrument, Scale};

        let instrument = |name: &str, scale: &str, sub: &str| Instrument {
            name: name.to_string(),
            scales: vec![Scale {
                name: scale.to_string(),
                subscales: vec![subscale(sub, &["1"])],
            }],
        };
        let store = InstrumentStore::new(vec![instrument("first", "A_B", "C"), instrument("second", "A", "B_C")])
            .unwrap();
        match columns(&store) {
            Err(ExportError::DuplicateColumn { column }) => assert_eq!(column, "A_B_C_1"),
            other => panic!("expected DuplicateColumn, got {:?}", other),
        }

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("csv");
        assert!(matches!(
            export(&ResultMap::new(), &store, &[Condition::QuestionLevel], &out),
            Err(ExportError::DuplicateColumn { .. })
        ));
        std::fs::write(dir.path().join("in.csv"), "persona_id,model,condition,A_B_C_1\n").unwrap();
        assert!(matches!(
            read_condition_csv(&dir.path().join("in.csv"), &store),
            Err(ExportError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_condition_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("condition_1.csv");
        let rows = write_condition_csv(&results(), &store(), Condition::QuestionLevel, &path).unwrap();
        assert_eq!(rows, 3);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "persona_id,model,condition,Big Five_Openness_Q1,Big Five_Openness_Q2");
        assert_eq!(lines[1], "1,gpt-4,condition_1,4,3");
        assert_eq!(lines[2], "2,gpt-4,condition_1,5,");
        assert_eq!(lines[3], "3,gpt-4,condition_1,,");
    }

    #[test]
    fn test_csv_round_trip_reconstructs_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("condition_1.csv");
        let results = results();
        let store = store();
        write_condition_csv(&results, &store, Condition::QuestionLevel, &path).unwrap();

        let rows = read_condition_csv(&path, &store).unwrap();
        assert_eq!(rows.len(), 3);
        for row in rows {
            let entry = results.get(row.persona_id, &row.model).unwrap();
            assert_eq!(row.condition, Condition::QuestionLevel);
            for (column, value) in &row.values {
                assert_eq!(
                    *value,
                    entry.value(row.condition, &column.scale, &column.subscale, &column.question_id)
                );
            }
        }
    }

    #[test]
    fn test_read_rejects_unknown_columns_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "persona_id,model,condition,Big Five_Openness_Q9\n1,gpt-4,condition_1,2\n").unwrap();
        assert!(matches!(
            read_condition_csv(&path, &store()),
            Err(ExportError::UnknownColumn { .. })
        ));

        std::fs::write(&path, "persona_id,model,condition,Big Five_Openness_Q1\n1,gpt-4,condition_1,four\n").unwrap();
        assert!(matches!(
            read_condition_csv(&path, &store()),
            Err(ExportError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_summary_counts() {
        let summary = summarize(&results(), &store(), &[Condition::QuestionLevel, Condition::ScaleLevel]);
        assert_eq!(summary.rows.len(), 2);

        let c1 = &summary.rows[0];
        assert_eq!(c1.condition, "condition_1");
        assert_eq!(c1.expected, 6);
        assert_eq!(c1.filled, 3);
        assert_eq!(c1.errors.get(&ResponseError::Unparseable), Some(&1));
        assert_eq!(c1.missing, 2);

        let c2 = &summary.rows[1];
        assert_eq!((c2.expected, c2.filled, c2.missing), (6, 0, 6));
    }

    #[test]
    fn test_export_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("csv");
        let report = export(&results(), &store(), &Condition::ALL, &out).unwrap();
        assert_eq!(report.files.len(), 5);
        for name in ["condition_1.csv", "condition_2.csv", "condition_3.csv", "summary.json", "summary.csv"] {
            assert!(out.join(name).exists(), "{}", name);
        }

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
        assert_eq!(json["rows"][0]["errors"]["unparseable"], 1);

        let csv = std::fs::read_to_string(out.join("summary.csv")).unwrap();
        assert!(csv.starts_with("condition,model,expected,filled,missing,unparseable,out_of_range"));
        assert!(csv.contains("condition_1,gpt-4,6,3,2,1,0,0,0,0,0,0"));
    }

    #[test]
    fn test_format_results_rewrites_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, serde_json::to_string(&results()).unwrap()).unwrap();
        let formatted = format_results(&path).unwrap();
        assert_eq!(formatted, results());
        assert!(std::fs::read_to_string(&path).unwrap().contains("\n  \"1_gpt-4\": {"));
    }

    #[test]
    fn test_format_results_rejects_mismatched_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"1_gpt-4": {"persona_id": 2, "model": "gpt-4", "responses": {}}}"#).unwrap();
        assert!(matches!(
            format_results(&path),
            Err(ExportError::InvalidResults { .. })
        ));
    }
}
