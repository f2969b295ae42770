//! Dataset loading and normalization.
//!
//! Source records come from differently shaped multiple-choice datasets.
//! Each logical field (question, choices, answer, subject) is resolved by
//! trying an ordered list of accessors and keeping the first that yields a
//! value. Records that cannot be normalized are dropped; a dataset where
//! every record is dropped is a schema mismatch.

use crate::config::DatasetConfig;
use crate::error::{EvalError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// A raw source record.
pub type Record = Map<String, Value>;

type Accessor<T> = fn(&Record) -> Option<T>;

const QUESTION_FIELDS: &[&str] = &["question", "prompt", "q"];
const ANSWER_FIELDS: &[&str] = &["answer", "label", "correct"];
const SUBJECT_FIELDS: &[&str] = &["subject", "category", "topic"];
const CATEGORY_FIELDS: &[&str] = &["subject", "category", "topic", "subset"];
const FLAT_CHOICE_FIELDS: &[&str] = &["A", "B", "C", "D", "a", "b", "c", "d"];

/// Choice shapes, in priority order.
const CHOICE_ACCESSORS: &[Accessor<Vec<String>>] = &[
    |r: &Record| list_field(r, "choices"),
    |r: &Record| list_field(r, "options"),
    flattened_choices,
];

/// Number of choice slots on every normalized item.
pub const CHOICE_COUNT: usize = 4;

/// A gold answer letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnswerLetter {
    A,
    B,
    C,
    D,
}

impl AnswerLetter {
    pub const ALL: [AnswerLetter; 4] = [Self::A, Self::B, Self::C, Self::D];

    /// Letter for a zero-based choice position.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Letter for an uppercase `A`..`D` character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            'D' => Some(Self::D),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

impl fmt::Display for AnswerLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized multiple-choice question.
///
/// Serialized as-is, this is also the gold ledger entry for the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    /// Position in the filtered source order. Join key for scoring.
    pub idx: usize,
    pub answer: AnswerLetter,
    pub question: String,
    /// Exactly four slots; sources with fewer choices are padded with "".
    pub choices: [String; CHOICE_COUNT],
    pub meta: Map<String, Value>,
}

/// Render a scalar JSON value as text. Null renders as nothing.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A value counts as present unless it is null or a blank string.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// First present value among `fields`.
fn first_present<'a>(record: &'a Record, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .filter_map(|field| record.get(*field))
        .find(|value| is_present(value))
}

fn list_field(record: &Record, field: &str) -> Option<Vec<String>> {
    match record.get(field) {
        Some(Value::Array(items)) if !items.is_empty() => Some(
            items
                .iter()
                .map(|v| value_text(v).unwrap_or_default())
                .collect(),
        ),
        _ => None,
    }
}

fn flattened_choices(record: &Record) -> Option<Vec<String>> {
    let choices: Vec<String> = FLAT_CHOICE_FIELDS
        .iter()
        .filter_map(|field| record.get(*field))
        .filter_map(value_text)
        .collect();
    if choices.is_empty() { None } else { Some(choices) }
}

/// Resolve a raw answer value to a letter.
///
/// Numbers 0..=3 are positions; strings are letters (any case) or the
/// verbatim text of one of `choices`. Anything else is unresolvable.
pub fn resolve_answer(value: &Value, choices: &[String]) -> Option<AnswerLetter> {
    match value {
        Value::Number(n) => {
            let f = n.as_f64()?.trunc();
            if !(0.0..=3.0).contains(&f) {
                return None;
            }
            AnswerLetter::from_index(f as usize)
        }
        Value::String(s) => {
            let trimmed = s.trim();
            let mut chars = trimmed.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if let Some(letter) = AnswerLetter::from_char(c.to_ascii_uppercase()) {
                    return Some(letter);
                }
            }
            choices
                .iter()
                .position(|choice| choice.trim() == trimmed)
                .and_then(AnswerLetter::from_index)
        }
        _ => None,
    }
}

/// Normalize one record, or `None` if it is disqualified.
pub fn standardize_record(record: &Record, idx: usize) -> Option<CanonicalItem> {
    let question = first_present(record, QUESTION_FIELDS).and_then(value_text)?;
    if question.trim().is_empty() {
        return None;
    }

    let mut choices = CHOICE_ACCESSORS.iter().find_map(|accessor| accessor(record))?;
    if choices.len() < 2 {
        return None;
    }
    choices.truncate(CHOICE_COUNT);

    let answer = resolve_answer(first_present(record, ANSWER_FIELDS)?, &choices)?;

    choices.resize(CHOICE_COUNT, String::new());
    let choices: [String; CHOICE_COUNT] = choices.try_into().ok()?;

    let subject = first_present(record, SUBJECT_FIELDS)
        .cloned()
        .unwrap_or(Value::Null);
    let mut meta = Map::new();
    meta.insert("subject".to_string(), subject);

    Some(CanonicalItem {
        idx,
        answer,
        question,
        choices,
        meta,
    })
}

fn category_key(s: &str) -> String {
    s.to_lowercase().replace(' ', "-")
}

/// Whether any record carries one of the category fields.
pub fn has_category_field(records: &[Record]) -> bool {
    records
        .iter()
        .any(|r| CATEGORY_FIELDS.iter().any(|f| r.contains_key(*f)))
}

/// Case-insensitive substring match of `category` against the category fields.
pub fn matches_category(record: &Record, category: &str) -> bool {
    let target = category_key(category);
    CATEGORY_FIELDS.iter().any(|field| {
        matches!(record.get(*field), Some(Value::String(v)) if category_key(v).contains(&target))
    })
}

/// Why the category filter cannot be applied, if it cannot.
fn filter_skip_reason(records: &[Record], category: &str) -> Option<&'static str> {
    if category.trim().is_empty() {
        Some("No category configured; keeping every record")
    } else if !has_category_field(records) {
        Some("Records carry no category field; treating the dataset as a single category")
    } else {
        None
    }
}

/// Filter `records` to `category` and normalize the survivors.
///
/// When no category is configured, or no record has a category field, the
/// filter is skipped and the dataset is treated as single-category.
pub fn normalize(records: &[Record], category: &str) -> Result<Vec<CanonicalItem>> {
    let skip = filter_skip_reason(records, category);
    if let Some(reason) = skip {
        warn!(category, "{}", reason);
    }
    let apply_filter = skip.is_none();

    let filtered: Vec<&Record> = records
        .iter()
        .filter(|r| !apply_filter || matches_category(r, category))
        .collect();

    let items: Vec<CanonicalItem> = filtered
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| standardize_record(record, idx))
        .collect();

    debug!(
        records = records.len(),
        filtered = filtered.len(),
        dropped = filtered.len() - items.len(),
        "Normalized dataset"
    );

    if items.is_empty() {
        return Err(EvalError::SchemaMismatch {
            records: records.len(),
            filtered: filtered.len(),
            category: category.to_string(),
        });
    }

    info!(items = items.len(), category, "Loaded question items");
    Ok(items)
}

fn invalid(path: &Path, reason: impl Into<String>) -> EvalError {
    EvalError::InvalidDataset {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn into_record(value: Value, path: &Path, position: usize) -> Result<Record> {
    match value {
        Value::Object(mut map) => match map.remove("row") {
            Some(Value::Object(row)) => Ok(row),
            Some(other) => {
                map.insert("row".to_string(), other);
                Ok(map)
            }
            None => Ok(map),
        },
        _ => Err(invalid(path, format!("record {} is not a JSON object", position + 1))),
    }
}

/// Load raw records from a `.jsonl` or `.json` file.
///
/// JSON files may hold a top-level array or an object with a `rows` array.
/// Entries shaped `{"row": {...}}` are unwrapped.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    if !path.is_file() {
        return Err(EvalError::missing("Dataset file", path));
    }
    let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;

    let is_jsonl = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jsonl") | Some("ndjson")
    );

    if is_jsonl {
        let mut records = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|e| invalid(path, format!("line {}: {}", line_num + 1, e)))?;
            records.push(into_record(value, path, line_num)?);
        }
        return Ok(records);
    }

    let value: Value = serde_json::from_str(&content).map_err(|e| invalid(path, e.to_string()))?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("rows") {
            Some(Value::Array(rows)) => rows,
            _ => return Err(invalid(path, "expected an array or an object with a 'rows' array")),
        },
        _ => return Err(invalid(path, "expected an array or an object with a 'rows' array")),
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, v)| into_record(v, path, i))
        .collect()
}

/// Load and normalize a dataset file.
pub fn load_items(path: &Path, category: &str) -> Result<Vec<CanonicalItem>> {
    let records = load_records(path)?;
    info!(records = records.len(), path = %path.display(), "Read dataset records");
    normalize(&records, category)
}

/// Write records as JSONL.
pub fn save_records_jsonl(records: &[Record], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
    }
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    fs::write(path, out).map_err(|e| EvalError::io(path, e))
}

/// Base URL of the Hugging Face datasets server.
pub const DATASETS_SERVER: &str = "https://datasets-server.huggingface.co";

const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    #[serde(default)]
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: Record,
}

/// Fetch every row of `{name, category, split}` from the datasets server.
///
/// The category is used as the dataset config name.
pub async fn download_rows(client: &Client, dataset: &DatasetConfig) -> Result<Vec<Record>> {
    let url = format!("{}/rows", DATASETS_SERVER);
    let mut records = Vec::new();

    loop {
        let offset = records.len().to_string();
        let length = PAGE_SIZE.to_string();
        let response = client
            .get(&url)
            .query(&[
                ("dataset", dataset.name.as_str()),
                ("config", dataset.category.as_str()),
                ("split", dataset.split.as_str()),
                ("offset", offset.as_str()),
                ("length", length.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EvalError::Http(format!(
                "Datasets server returned {}: {}",
                status, body
            )));
        }

        let page: RowsPage = serde_json::from_str(&body)?;
        let fetched = page.rows.len();
        records.extend(page.rows.into_iter().map(|entry| entry.row));
        debug!(fetched, total = records.len(), "Fetched dataset page");

        let done = match page.num_rows_total {
            Some(total) => records.len() >= total,
            None => fetched < PAGE_SIZE,
        };
        if done || fetched == 0 {
            break;
        }
    }

    Ok(records)
}
