//! Error types for the evaluation pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors that can occur while indexing, building batches or scoring.
#[derive(Error, Debug)]
pub enum EvalError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A run artifact required by the current stage does not exist.
    #[error("{kind} not found at '{path}'")]
    MissingArtifact { kind: &'static str, path: PathBuf },

    /// No record of the dataset could be normalized into a question item.
    #[error(
        "No usable questions for category '{category}': {filtered} of {records} records passed \
         the category filter but none had a recognizable question/choices/answer schema"
    )]
    SchemaMismatch {
        records: usize,
        filtered: usize,
        category: String,
    },

    /// The dataset file could not be interpreted as records.
    #[error("Invalid dataset at '{path}': {reason}")]
    InvalidDataset { path: PathBuf, reason: String },

    /// Another process is building the vector index.
    #[error("Index build already in progress (marker '{0}' exists)")]
    IndexLocked(PathBuf),

    /// Two requests would share one custom id.
    #[error("Duplicate custom id '{0}'")]
    DuplicateCustomId(String),

    /// Embedding service error.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// LLM API error.
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM response parsing error.
    #[error("Failed to parse LLM response: {0}")]
    LlmParse(String),

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Configuration file error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EvalError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a missing-artifact error.
    pub fn missing(kind: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::MissingArtifact {
            kind,
            path: path.into(),
        }
    }
}

impl From<reqwest::Error> for EvalError {
    fn from(err: reqwest::Error) -> Self {
        EvalError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::Serialization(err.to_string())
    }
}
