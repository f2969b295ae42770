//! Per-run output directories.
//!
//! Each evaluation run owns a timestamped directory under the outputs root.
//! The most recent run is recorded in `latest_run.txt` so later stages can
//! find it without being told.

use super::batch::BatchRequestRow;
use super::dataset::CanonicalItem;
use crate::error::{EvalError, Result};
use crate::llm::BatchStatus;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Pointer file naming the latest run directory.
pub const LATEST_FILENAME: &str = "latest_run.txt";
/// Gold/meta ledger.
pub const GOLD_FILENAME: &str = "dataset_meta.json";
/// Batch request file.
pub const INPUT_FILENAME: &str = "batch_input.jsonl";
/// Submission state.
pub const RUN_META_FILENAME: &str = "run_meta.json";
/// Completion file downloaded from the batch service.
pub const OUTPUT_FILENAME: &str = "batch_output.jsonl";
/// Scoring report.
pub const METRICS_FILENAME: &str = "metrics.json";

const OK_MARKER: &str = "_ok";

/// Submission record for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub batch_id: String,
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: String,
    pub chat_model: String,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
}

/// A run output directory.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Use an existing directory as a run.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create `{prefix}_{YYYYmmdd_HHMMSS}` under `outputs` and mark it latest.
    pub fn create(outputs: &Path, prefix: &str) -> Result<Self> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Self::create_named(outputs, &format!("{}_{}", prefix, stamp))
    }

    /// Claim a fresh directory named `name`, or `name_2`, `name_3`, ...
    /// when an earlier run already took it.
    fn create_named(outputs: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(outputs).map_err(|e| EvalError::io(outputs, e))?;

        let mut attempt = 1;
        let path = loop {
            let candidate = if attempt == 1 {
                outputs.join(name)
            } else {
                outputs.join(format!("{}_{}", name, attempt))
            };
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(EvalError::io(&candidate, e)),
            }
        };

        let marker = path.join(OK_MARKER);
        fs::write(&marker, b"").map_err(|e| EvalError::io(&marker, e))?;

        let latest = outputs.join(LATEST_FILENAME);
        fs::write(&latest, path.to_string_lossy().as_bytes())
            .map_err(|e| EvalError::io(&latest, e))?;

        Ok(Self { path })
    }

    /// Resolve the run named in `outputs/latest_run.txt`.
    pub fn latest(outputs: &Path) -> Result<Self> {
        let latest = outputs.join(LATEST_FILENAME);
        if !latest.is_file() {
            return Err(EvalError::missing("Latest run pointer", latest));
        }
        let content = fs::read_to_string(&latest).map_err(|e| EvalError::io(&latest, e))?;
        Ok(Self::open(content.trim()))
    }

    /// Explicit directory if given, else the latest run.
    pub fn resolve(explicit: Option<&Path>, outputs: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Ok(Self::open(path)),
            None => Self::latest(outputs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn gold_path(&self) -> PathBuf {
        self.path.join(GOLD_FILENAME)
    }

    pub fn input_path(&self) -> PathBuf {
        self.path.join(INPUT_FILENAME)
    }

    pub fn run_meta_path(&self) -> PathBuf {
        self.path.join(RUN_META_FILENAME)
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join(OUTPUT_FILENAME)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.path.join(METRICS_FILENAME)
    }

    /// Persist the gold ledger, then the request rows.
    ///
    /// The ledger is written once; a run that already has one is refused.
    /// Requests are staged and renamed so a reader never sees a partial file.
    pub fn write_batch_input(&self, items: &[CanonicalItem], rows: &[BatchRequestRow]) -> Result<()> {
        let gold_path = self.gold_path();
        let ledger = serde_json::to_string_pretty(items)
            .map_err(|e| EvalError::Serialization(e.to_string()))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&gold_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EvalError::io(
                    &gold_path,
                    std::io::Error::new(ErrorKind::AlreadyExists, "gold ledger already written"),
                ));
            }
            Err(e) => return Err(EvalError::io(&gold_path, e)),
        };
        file.write_all(ledger.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| EvalError::io(&gold_path, e))?;

        let mut lines = String::new();
        for row in rows {
            lines.push_str(&serde_json::to_string(row)?);
            lines.push('\n');
        }

        let input_path = self.input_path();
        let staged = self.path.join(format!("{}.tmp", INPUT_FILENAME));
        fs::write(&staged, lines).map_err(|e| EvalError::io(&staged, e))?;
        fs::rename(&staged, &input_path).map_err(|e| EvalError::io(&input_path, e))?;

        Ok(())
    }

    /// Read the gold ledger.
    pub fn read_gold(&self) -> Result<Vec<CanonicalItem>> {
        let path = self.gold_path();
        if !path.is_file() {
            return Err(EvalError::missing("Gold ledger", path));
        }
        let content = fs::read_to_string(&path).map_err(|e| EvalError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| EvalError::Serialization(e.to_string()))
    }

    pub fn write_run_meta(&self, meta: &RunMeta) -> Result<()> {
        let path = self.run_meta_path();
        let json =
            serde_json::to_string_pretty(meta).map_err(|e| EvalError::Serialization(e.to_string()))?;
        fs::write(&path, json).map_err(|e| EvalError::io(&path, e))
    }

    pub fn read_run_meta(&self) -> Result<RunMeta> {
        let path = self.run_meta_path();
        if !path.is_file() {
            return Err(EvalError::missing("Run metadata (submit the batch first)", path));
        }
        let content = fs::read_to_string(&path).map_err(|e| EvalError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| EvalError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::dataset::AnswerLetter;
    use serde_json::Map;
    use tempfile::TempDir;

    fn item(idx: usize) -> CanonicalItem {
        CanonicalItem {
            idx,
            answer: AnswerLetter::C,
            question: format!("question {}", idx),
            choices: ["a", "b", "c", "d"].map(String::from),
            meta: Map::new(),
        }
    }

    #[test]
    fn test_create_and_resolve_latest() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::create(dir.path(), "kmmlu_criminal_law").unwrap();

        assert!(run.path().join(OK_MARKER).exists());
        let name = run.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("kmmlu_criminal_law_"));

        let latest = RunDir::latest(dir.path()).unwrap();
        assert_eq!(latest.path(), run.path());

        let explicit = RunDir::resolve(Some(Path::new("/elsewhere")), dir.path()).unwrap();
        assert_eq!(explicit.path(), Path::new("/elsewhere"));
    }

    #[test]
    fn test_same_name_runs_get_distinct_dirs() {
        let dir = TempDir::new().unwrap();
        let first = RunDir::create_named(dir.path(), "kmmlu_x_20260101_000000").unwrap();
        let second = RunDir::create_named(dir.path(), "kmmlu_x_20260101_000000").unwrap();

        assert_ne!(first.path(), second.path());
        assert!(second.path().ends_with("kmmlu_x_20260101_000000_2"));
        assert_eq!(RunDir::latest(dir.path()).unwrap().path(), second.path());

        first.write_batch_input(&[item(0)], &[]).unwrap();
        second.write_batch_input(&[item(0)], &[]).unwrap();
    }

    #[test]
    fn test_latest_missing_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            RunDir::latest(dir.path()),
            Err(EvalError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn test_gold_ledger_round_trip_and_immutable() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::open(dir.path());
        let items = vec![item(0), item(2)];

        run.write_batch_input(&items, &[]).unwrap();
        assert_eq!(run.read_gold().unwrap(), items);
        assert!(run.input_path().exists());

        assert!(run.write_batch_input(&items, &[]).is_err());
    }

    #[test]
    fn test_read_gold_missing() {
        let dir = TempDir::new().unwrap();
        let err = RunDir::open(dir.path()).read_gold().unwrap_err();
        assert!(err.to_string().contains(GOLD_FILENAME));
    }

    #[test]
    fn test_run_meta_round_trip() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::open(dir.path());
        assert!(run.read_run_meta().is_err());

        let meta = RunMeta {
            batch_id: "batch_1".to_string(),
            input_file_id: "file-1".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            completion_window: "24h".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            status: BatchStatus::Validating,
            output_file_id: None,
        };
        run.write_run_meta(&meta).unwrap();
        assert_eq!(run.read_run_meta().unwrap(), meta);
    }
}
