//! Exact inner-product vector index over normalized chunk embeddings.
//!
//! Every query is compared against every stored vector. Vectors are unit
//! length, so the inner product equals cosine similarity.

use super::chunker::Chunk;
use super::embeddings::{Embedder, dot, embed_all, l2_normalize};
use crate::error::{EvalError, Result};
use tracing::info;

/// A search hit: chunk position and similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// Position of the chunk in the index.
    pub id: usize,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Flat vector index. Position `i` of `chunks` owns vector `i`.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    embedding_model: String,
    dim: usize,
    chunks: Vec<Chunk>,
    vectors: Vec<f32>,
}

impl VectorIndex {
    /// Embed and index `chunks`.
    pub async fn build<E: Embedder>(
        chunks: Vec<Chunk>,
        embedder: &E,
        batch_size: usize,
    ) -> Result<Self> {
        if chunks.is_empty() {
            return Err(EvalError::Embedding("No chunks to index".to_string()));
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = embed_all(embedder, &texts, batch_size).await?;

        let index = Self::from_embeddings(embedder.model_id(), chunks, embeddings)?;
        info!(
            chunks = index.len(),
            dim = index.dim,
            model = %index.embedding_model,
            "Built vector index"
        );
        Ok(index)
    }

    /// Assemble an index from raw per-chunk embeddings, normalizing each.
    pub fn from_embeddings(
        embedding_model: impl Into<String>,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if chunks.len() != embeddings.len() {
            return Err(EvalError::Embedding(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        let dim = embeddings.first().map(Vec::len).unwrap_or(0);
        if dim == 0 && !chunks.is_empty() {
            return Err(EvalError::Embedding("Embeddings have zero dimension".to_string()));
        }

        let mut vectors = Vec::with_capacity(dim * embeddings.len());
        for (i, mut v) in embeddings.into_iter().enumerate() {
            if v.len() != dim {
                return Err(EvalError::Embedding(format!(
                    "Embedding {} has dimension {}, expected {}",
                    i,
                    v.len(),
                    dim
                )));
            }
            l2_normalize(&mut v);
            vectors.extend(v);
        }

        Ok(Self {
            embedding_model: embedding_model.into(),
            dim,
            chunks,
            vectors,
        })
    }

    /// Reassemble a persisted index. `vectors` is the flat, already
    /// normalized matrix.
    pub fn from_parts(
        embedding_model: impl Into<String>,
        dim: usize,
        chunks: Vec<Chunk>,
        vectors: Vec<f32>,
    ) -> Result<Self> {
        if dim == 0 || vectors.len() != dim * chunks.len() {
            return Err(EvalError::Serialization(format!(
                "Index holds {} floats, expected {} chunks x dim {}",
                vectors.len(),
                chunks.len(),
                dim
            )));
        }

        Ok(Self {
            embedding_model: embedding_model.into(),
            dim,
            chunks,
            vectors,
        })
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Flat row-major vector matrix.
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    /// Stored vector for chunk `id`.
    pub fn vector(&self, id: usize) -> Option<&[f32]> {
        let start = id.checked_mul(self.dim)?;
        self.vectors.get(start..start + self.dim)
    }

    /// Number of chunks in the index.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Exhaustive top-`k` search by cosine similarity.
    ///
    /// Ties keep index order, so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(EvalError::Embedding(format!(
                "Query has dimension {}, index has {}",
                query.len(),
                self.dim
            )));
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut hits: Vec<SearchHit> = self
            .vectors
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(id, v)| SearchHit {
                id,
                score: dot(&q, v),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    /// Chunk texts for `hits`, skipping ids that do not exist.
    pub fn texts(&self, hits: &[SearchHit]) -> Vec<&str> {
        hits.iter()
            .filter_map(|hit| self.chunks.get(hit.id))
            .map(|chunk| chunk.text.as_str())
            .collect()
    }

    /// Embed `text` and return up to `k` most similar chunk texts.
    pub async fn query<E: Embedder>(&self, embedder: &E, text: &str, k: usize) -> Result<Vec<String>> {
        let mut embedded = embedder.embed_batch(&[text]).await?;
        let query = embedded
            .pop()
            .ok_or_else(|| EvalError::Embedding("Empty embedding response for query".to_string()))?;

        let hits = self.search(&query, k)?;
        Ok(self.texts(&hits).into_iter().map(str::to_string).collect())
    }
}
