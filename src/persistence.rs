//! Persistence layer for the vector index.
//!
//! An index is stored as two companion files in one directory: `index.bin`
//! (bincode, the normalized vector matrix) and `meta.json` (human-readable
//! chunk metadata). A load that finds anything missing or inconsistent is
//! answered with a full rebuild from the raw corpus.

use crate::config::Config;
use crate::error::{EvalError, Result};
use crate::rag::chunker::{Chunk, ChunkConfig, chunk_documents};
use crate::rag::corpus::{load_documents, seed_document};
use crate::rag::embeddings::Embedder;
use crate::rag::vector_index::VectorIndex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default filename for the vector matrix.
pub const INDEX_FILENAME: &str = "index.bin";

/// Default filename for chunk metadata.
pub const META_FILENAME: &str = "meta.json";

/// Marker present while a build is writing to the directory.
pub const BUILD_MARKER: &str = ".building";

/// Chunk metadata stored next to the vector matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub embedding_model: String,
    pub chunks: Vec<String>,
    pub src_ids: Vec<usize>,
    pub dim: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredVectors {
    dim: usize,
    vectors: Vec<f32>,
}

/// Paths of the index artifacts inside `dir`.
pub fn index_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(INDEX_FILENAME), dir.join(META_FILENAME))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_then_rename(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, data).map_err(|e| EvalError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| EvalError::io(path, e))
}

/// Save an index into `dir`.
///
/// Both files are staged under temporary names. The old metadata is removed
/// before the new matrix is moved in and the new metadata is moved in last,
/// so an interrupted save never leaves a pair that loads.
pub fn save_index(index: &VectorIndex, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| EvalError::io(dir, e))?;
    let (index_path, meta_path) = index_paths(dir);

    let stored = StoredVectors {
        dim: index.dim(),
        vectors: index.vectors().to_vec(),
    };
    let vectors = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| EvalError::Serialization(e.to_string()))?;

    let meta = IndexMeta {
        embedding_model: index.embedding_model().to_string(),
        chunks: index.chunks().iter().map(|c| c.text.clone()).collect(),
        src_ids: index.chunks().iter().map(|c| c.source_id).collect(),
        dim: index.dim(),
    };
    let meta_json = serde_json::to_string_pretty(&meta)
        .map_err(|e| EvalError::Serialization(e.to_string()))?;

    let staged_vectors = tmp_path(&index_path);
    fs::write(&staged_vectors, &vectors).map_err(|e| EvalError::io(&staged_vectors, e))?;

    match fs::remove_file(&meta_path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(EvalError::io(&meta_path, e)),
    }
    fs::rename(&staged_vectors, &index_path).map_err(|e| EvalError::io(&index_path, e))?;
    write_then_rename(&meta_path, meta_json.as_bytes())?;

    Ok(())
}

/// Load an index from `dir`, checking that both artifacts agree.
pub fn load_index(dir: &Path) -> Result<VectorIndex> {
    let (index_path, meta_path) = index_paths(dir);

    if !index_path.is_file() {
        return Err(EvalError::missing("Index vectors", index_path));
    }
    if !meta_path.is_file() {
        return Err(EvalError::missing("Index metadata", meta_path));
    }

    let meta_str = fs::read_to_string(&meta_path).map_err(|e| EvalError::io(&meta_path, e))?;
    let meta: IndexMeta =
        serde_json::from_str(&meta_str).map_err(|e| EvalError::Serialization(e.to_string()))?;

    let data = fs::read(&index_path).map_err(|e| EvalError::io(&index_path, e))?;
    let (stored, _): (StoredVectors, usize) =
        bincode::serde::decode_from_slice(&data, bincode::config::standard())
            .map_err(|e| EvalError::Serialization(e.to_string()))?;

    if meta.chunks.len() != meta.src_ids.len() {
        return Err(EvalError::Serialization(format!(
            "Metadata lists {} chunks but {} source ids",
            meta.chunks.len(),
            meta.src_ids.len()
        )));
    }
    if stored.dim != meta.dim {
        return Err(EvalError::Serialization(format!(
            "Vector dimension {} does not match metadata dimension {}",
            stored.dim, meta.dim
        )));
    }

    let chunks = meta
        .chunks
        .into_iter()
        .zip(meta.src_ids)
        .map(|(text, source_id)| Chunk { text, source_id })
        .collect();

    VectorIndex::from_parts(meta.embedding_model, meta.dim, chunks, stored.vectors)
}

/// Exclusive claim on an index directory for the duration of a build.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    /// Create the build marker, failing if another build holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| EvalError::io(dir, e))?;
        let path = dir.join(BUILD_MARKER);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(EvalError::IndexLocked(path)),
            Err(e) => Err(EvalError::io(&path, e)),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove build marker");
        }
    }
}

/// Where to find the index and how to rebuild it.
#[derive(Debug, Clone)]
pub struct IndexSource {
    /// Directory of persisted artifacts.
    pub vector_dir: PathBuf,
    /// Raw corpus directory used for rebuilds.
    pub raw_dir: PathBuf,
    pub chunk_config: ChunkConfig,
    pub batch_size: usize,
}

impl IndexSource {
    /// Paths and batch size from the configuration, default chunking.
    pub fn from_config(config: &Config) -> Self {
        Self {
            vector_dir: config.paths.vector_dir.clone(),
            raw_dir: config.paths.raw_dir.clone(),
            chunk_config: ChunkConfig::default(),
            batch_size: config.embedding.batch_size,
        }
    }

    /// Load the persisted index if usable for `embedder`'s model.
    fn try_load(&self, model_id: &str) -> Option<VectorIndex> {
        match load_index(&self.vector_dir) {
            Ok(index) if index.embedding_model() == model_id => Some(index),
            Ok(index) => {
                info!(
                    stored = index.embedding_model(),
                    configured = model_id,
                    "Persisted index uses a different embedding model, rebuilding"
                );
                None
            }
            Err(EvalError::MissingArtifact { kind, path }) => {
                info!(kind, path = %path.display(), "Persisted index incomplete, rebuilding");
                None
            }
            Err(e) => {
                warn!(error = %e, "Persisted index unreadable, rebuilding");
                None
            }
        }
    }

    /// Chunk the raw corpus and embed it, then persist the result.
    pub async fn build<E: Embedder>(&self, embedder: &E) -> Result<VectorIndex> {
        let _lock = BuildLock::acquire(&self.vector_dir)?;
        self.build_locked(embedder).await
    }

    async fn build_locked<E: Embedder>(&self, embedder: &E) -> Result<VectorIndex> {
        let documents = load_documents(&self.raw_dir)?;
        let mut chunks = chunk_documents(&documents, &self.chunk_config);
        if chunks.is_empty() {
            warn!(dir = %self.raw_dir.display(), "Corpus produced no chunks, indexing seed document");
            chunks = chunk_documents(&[seed_document()], &self.chunk_config);
        }

        let index = VectorIndex::build(chunks, embedder, self.batch_size).await?;
        save_index(&index, &self.vector_dir)?;
        info!(dir = %self.vector_dir.display(), "Saved vector index");
        Ok(index)
    }

    /// Load the persisted index, rebuilding it wholesale on any miss.
    pub async fn load_or_build<E: Embedder>(&self, embedder: &E) -> Result<VectorIndex> {
        if let Some(index) = self.try_load(embedder.model_id()) {
            info!(chunks = index.len(), "Loaded persisted vector index");
            return Ok(index);
        }

        let _lock = BuildLock::acquire(&self.vector_dir)?;
        // A concurrent builder may have finished between the load and the lock.
        if let Some(index) = self.try_load(embedder.model_id()) {
            return Ok(index);
        }
        self.build_locked(embedder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::embeddings::testing::HashEmbedder;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> IndexSource {
        IndexSource {
            vector_dir: dir.path().join("vectorstore"),
            raw_dir: dir.path().join("raw"),
            chunk_config: ChunkConfig {
                max_chars: 40,
                overlap: 10,
            },
            batch_size: 3,
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_query_results() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir);
        let embedder = HashEmbedder::new(48);

        let built = src.load_or_build(&embedder).await.unwrap();
        assert!(src.vector_dir.join(INDEX_FILENAME).exists());
        assert!(src.vector_dir.join(META_FILENAME).exists());
        assert!(!src.vector_dir.join(BUILD_MARKER).exists());

        let loaded = load_index(&src.vector_dir).unwrap();
        assert_eq!(loaded.chunks(), built.chunks());
        assert_eq!(loaded.vectors(), built.vectors());

        for q in ["정당방위 요건", "공동정범과 간접정범", "책임무능력"] {
            let a = built.query(&embedder, q, 3).await.unwrap();
            let b = loaded.query(&embedder, q, 3).await.unwrap();
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn test_missing_meta_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir);
        let embedder = HashEmbedder::new(16);

        src.load_or_build(&embedder).await.unwrap();
        fs::remove_file(src.vector_dir.join(META_FILENAME)).unwrap();
        assert!(matches!(
            load_index(&src.vector_dir),
            Err(EvalError::MissingArtifact { .. })
        ));

        let rebuilt = src.load_or_build(&embedder).await.unwrap();
        assert!(!rebuilt.is_empty());
        assert!(src.vector_dir.join(META_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_mismatched_lengths_trigger_rebuild() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir);
        let embedder = HashEmbedder::new(16);

        let built = src.load_or_build(&embedder).await.unwrap();

        let meta_path = src.vector_dir.join(META_FILENAME);
        let mut meta: IndexMeta =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta.chunks.push("extra".to_string());
        meta.src_ids.push(9);
        fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

        assert!(load_index(&src.vector_dir).is_err());
        let rebuilt = src.load_or_build(&embedder).await.unwrap();
        assert_eq!(rebuilt.len(), built.len());
    }

    #[tokio::test]
    async fn test_model_change_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir);
        let embedder = HashEmbedder::new(16);

        src.load_or_build(&embedder).await.unwrap();
        let meta_path = src.vector_dir.join(META_FILENAME);
        let mut meta: IndexMeta =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta.embedding_model = "other-model".to_string();
        fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let index = src.load_or_build(&embedder).await.unwrap();
        assert_eq!(index.embedding_model(), "test-hash");
    }

    #[tokio::test]
    async fn test_concurrent_build_is_refused() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir);
        let embedder = HashEmbedder::new(16);

        let _held = BuildLock::acquire(&src.vector_dir).unwrap();
        let result = src.load_or_build(&embedder).await;
        assert!(matches!(result, Err(EvalError::IndexLocked(_))));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = BuildLock::acquire(dir.path()).unwrap();
            assert!(BuildLock::acquire(dir.path()).is_err());
        }
        assert!(BuildLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_meta_json_is_readable() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::from_embeddings(
            "text-embedding-3-small",
            vec![Chunk {
                text: "형법 총론".to_string(),
                source_id: 4,
            }],
            vec![vec![1.0, 1.0]],
        )
        .unwrap();

        save_index(&index, dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join(META_FILENAME)).unwrap();
        assert!(content.contains("형법 총론"));
        assert!(content.contains("\"dim\": 2"));
        assert!(content.contains("\"src_ids\""));
        assert!(!dir.path().join("index.bin.tmp").exists());
    }
}
