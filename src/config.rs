//! Configuration for the evaluation pipeline.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the OpenAI-compatible API (e.g., "https://api.openai.com")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Chat model used for answering questions
    pub model: String,

    /// Maximum tokens for response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    16
}

fn default_temperature() -> f32 {
    0.0
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Where embeddings are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI-compatible `/v1/embeddings` endpoint.
    #[default]
    OpenAi,
    /// Local sentence-transformers model (`local-embeddings` feature).
    Local,
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "local" => Ok(Self::Local),
            other => Err(EvalError::Config(format!(
                "Unknown embedding backend '{}', expected 'openai' or 'local'",
                other
            ))),
        }
    }
}

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Which embedding service to call.
    #[serde(default)]
    pub backend: EmbeddingBackend,

    /// Embedding model identifier, stored alongside the persisted index.
    pub model: String,

    /// Texts per embedding request. Throughput only.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::OpenAi,
            model: "text-embedding-3-small".to_string(),
            batch_size: 128,
        }
    }
}

/// Source dataset selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Hugging Face dataset name.
    pub name: String,
    /// Category label used for filtering.
    pub category: String,
    /// Split identifier.
    pub split: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "HAERAEHUB/KMMLU".to_string(),
            category: "Criminal-Law".to_string(),
            split: "test".to_string(),
        }
    }
}

/// Batch API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Endpoint every request row targets.
    pub endpoint: String,
    /// Completion window requested from the batch service.
    pub completion_window: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            endpoint: "/v1/chat/completions".to_string(),
            completion_window: "24h".to_string(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding raw `*.txt` reference documents.
    pub raw_dir: PathBuf,
    /// Directory holding the persisted vector index.
    pub vector_dir: PathBuf,
    /// Root of the per-run output directories.
    pub outputs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("rag/data/raw"),
            vector_dir: PathBuf::from("rag/vectorstore"),
            outputs_dir: PathBuf::from("outputs"),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub dataset: DatasetConfig,
    pub batch: BatchConfig,
    pub paths: PathsConfig,
}

/// Configuration file structure (YAML format).
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    llm: Option<LlmFileSection>,
    embedding: Option<EmbeddingFileSection>,
    dataset: Option<DatasetFileSection>,
    batch: Option<BatchFileSection>,
    paths: Option<PathsFileSection>,
}

#[derive(Debug, Deserialize)]
struct LlmFileSection {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingFileSection {
    backend: Option<EmbeddingBackend>,
    model: Option<String>,
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DatasetFileSection {
    name: Option<String>,
    category: Option<String>,
    split: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchFileSection {
    endpoint: Option<String>,
    completion_window: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PathsFileSection {
    raw_dir: Option<PathBuf>,
    vector_dir: Option<PathBuf>,
    outputs_dir: Option<PathBuf>,
}

fn set_if<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_API_BASE, LLM_API_KEY, CHAT_MODEL, ...)
    /// 2. Config file (~/.config/kmmlu-rag/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from an environment-style lookup.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        set_if(&mut self.llm.api_base, lookup("LLM_API_BASE"));
        set_if(
            &mut self.llm.api_key,
            lookup("LLM_API_KEY").or_else(|| lookup("OPENAI_API_KEY")),
        );
        set_if(&mut self.llm.model, lookup("CHAT_MODEL"));
        set_if(
            &mut self.llm.max_tokens,
            lookup("LLM_MAX_TOKENS").and_then(|v| v.parse().ok()),
        );
        set_if(
            &mut self.llm.temperature,
            lookup("LLM_TEMPERATURE").and_then(|v| v.parse().ok()),
        );

        set_if(
            &mut self.embedding.backend,
            lookup("EMBEDDING_BACKEND").and_then(|v| v.parse().ok()),
        );
        set_if(&mut self.embedding.model, lookup("EMBEDDING_MODEL"));
        set_if(
            &mut self.embedding.batch_size,
            lookup("EMBEDDING_BATCH_SIZE").and_then(|v| v.parse().ok()),
        );

        set_if(&mut self.dataset.name, lookup("KMMLU_DATASET_NAME"));
        set_if(&mut self.dataset.category, lookup("KMMLU_CATEGORY"));
        set_if(&mut self.dataset.split, lookup("KMMLU_SPLIT"));

        set_if(&mut self.batch.endpoint, lookup("BATCH_ENDPOINT"));
        set_if(
            &mut self.batch.completion_window,
            lookup("BATCH_COMPLETION_WINDOW"),
        );

        set_if(&mut self.paths.raw_dir, lookup("RAG_RAW_DIR").map(PathBuf::from));
        set_if(
            &mut self.paths.vector_dir,
            lookup("RAG_VECTOR_DIR").map(PathBuf::from),
        );
        set_if(
            &mut self.paths.outputs_dir,
            lookup("OUTPUTS_DIR").map(PathBuf::from),
        );
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        Self::from_yaml(&content)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        let file_config: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config file: {}", e)))?;

        let mut config = Config::default();

        if let Some(llm) = file_config.llm {
            set_if(&mut config.llm.api_base, llm.api_base);
            set_if(&mut config.llm.api_key, llm.api_key);
            set_if(&mut config.llm.model, llm.model);
            set_if(&mut config.llm.max_tokens, llm.max_tokens);
            set_if(&mut config.llm.temperature, llm.temperature);
        }

        if let Some(embedding) = file_config.embedding {
            set_if(&mut config.embedding.backend, embedding.backend);
            set_if(&mut config.embedding.model, embedding.model);
            set_if(&mut config.embedding.batch_size, embedding.batch_size);
        }

        if let Some(dataset) = file_config.dataset {
            set_if(&mut config.dataset.name, dataset.name);
            set_if(&mut config.dataset.category, dataset.category);
            set_if(&mut config.dataset.split, dataset.split);
        }

        if let Some(batch) = file_config.batch {
            set_if(&mut config.batch.endpoint, batch.endpoint);
            set_if(&mut config.batch.completion_window, batch.completion_window);
        }

        if let Some(paths) = file_config.paths {
            set_if(&mut config.paths.raw_dir, paths.raw_dir);
            set_if(&mut config.paths.vector_dir, paths.vector_dir);
            set_if(&mut config.paths.outputs_dir, paths.outputs_dir);
        }

        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "kmmlu-rag")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate that settings needed for network calls are present.
    pub fn validate(&self) -> Result<()> {
        self.validate_embedding()?;

        if self.llm.api_base.is_empty() {
            return Err(EvalError::Config(
                "API base URL is required. Set LLM_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.api_key.is_empty() {
            return Err(EvalError::Config(
                "API key is required. Set LLM_API_KEY (or OPENAI_API_KEY) environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.model.is_empty() {
            return Err(EvalError::Config(
                "Chat model is required. Set CHAT_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Validate only what building or querying the index needs.
    pub fn validate_embedding(&self) -> Result<()> {
        if self.embedding.model.is_empty() {
            return Err(EvalError::Config(
                "Embedding model is required. Set EMBEDDING_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(EvalError::Config(
                "Embedding batch size must be at least 1".to_string(),
            ));
        }

        if self.embedding.backend == EmbeddingBackend::OpenAi && self.llm.api_key.is_empty() {
            return Err(EvalError::Config(
                "API key is required for remote embeddings. Set LLM_API_KEY (or OPENAI_API_KEY)."
                    .to_string(),
            ));
        }

        Ok(())
    }
}
