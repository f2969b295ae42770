//! Raw reference corpus loading.
//!
//! The corpus is every `*.txt` file under the raw data directory. When the
//! directory holds no documents a small seed document is written so that
//! index builds never start from an empty corpus.

use crate::error::{EvalError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// File name of the seed document written into an empty corpus.
pub const SEED_FILENAME: &str = "criminal_law_ko_sample.txt";

const SEED_TEXT: &str = "형법 개론\n\
형법은 범죄와 형벌을 규정하는 법률로서, 구성요건해당성, 위법성, 책임의 원칙을 기반으로 한다.\n\
구성요건은 범죄의 성립 요건을 의미하며, 고의와 과실 등 주관적 요소와 행위의 객관적 요소가 포함된다.\n\
정당방위, 긴급피난 등 위법성조각사유가 존재할 수 있으며, 책임 조각사유로는 심신상실, 책임무능력 등이 있다.\n\
공동정범과 간접정범, 교사범과 방조범의 구별, 미수범 처벌 요건 등도 중요하다.\n";

/// A raw reference document.
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Position of the document in the corpus.
    pub source_id: usize,
    /// Original file path (if loaded from file).
    pub path: Option<PathBuf>,
    /// Full text.
    pub text: String,
}

impl RawDocument {
    pub fn new(source_id: usize, text: impl Into<String>) -> Self {
        Self {
            source_id,
            path: None,
            text: text.into(),
        }
    }
}

/// The in-memory seed document.
pub fn seed_document() -> RawDocument {
    RawDocument::new(0, SEED_TEXT)
}

/// List `*.txt` files under `dir`, sorted by path.
fn text_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("txt"))
        .collect();
    files.sort();
    files
}

/// Write the seed document when `dir` contains no text files.
pub fn ensure_seed_document(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| EvalError::io(dir, e))?;

    if text_files(dir).is_empty() {
        let seed = dir.join(SEED_FILENAME);
        info!(path = %seed.display(), "Corpus is empty, writing seed document");
        fs::write(&seed, SEED_TEXT).map_err(|e| EvalError::io(&seed, e))?;
    }

    Ok(())
}

/// Load every readable text document under `dir`.
///
/// Unreadable files are skipped. Source ids follow the sorted path order.
pub fn load_documents(dir: &Path) -> Result<Vec<RawDocument>> {
    ensure_seed_document(dir)?;

    let mut documents = Vec::new();
    for path in text_files(dir) {
        match fs::read_to_string(&path) {
            Ok(text) => documents.push(RawDocument {
                source_id: documents.len(),
                path: Some(path),
                text,
            }),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
        }
    }

    info!(count = documents.len(), dir = %dir.display(), "Loaded corpus documents");
    Ok(documents)
}
