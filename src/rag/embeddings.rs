//! Embedding service access.
//!
//! The index never computes embeddings itself; it asks an [`Embedder`]
//! for one vector per input text, in input order.

use crate::config::{EmbeddingBackend, EmbeddingConfig, LlmConfig};
use crate::error::{EvalError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Source of dense text embeddings.
#[allow(async_fn_in_trait)]
pub trait Embedder {
    /// Identifier of the model producing the vectors.
    fn model_id(&self) -> &str;

    /// Embed a batch of texts. Returns exactly one vector per input, in order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in fixed-size batches and concatenate the results in order.
///
/// The batch size only affects how many requests are made.
pub async fn embed_all<E: Embedder>(
    embedder: &E,
    texts: &[&str],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let total_batches = texts.len().div_ceil(batch_size);
    let mut vectors = Vec::with_capacity(texts.len());

    for (i, batch) in texts.chunks(batch_size).enumerate() {
        debug!(batch = i + 1, total_batches, size = batch.len(), "Embedding batch");
        let embedded = embedder.embed_batch(batch).await?;
        if embedded.len() != batch.len() {
            return Err(EvalError::Embedding(format!(
                "Expected {} embeddings in batch {}, got {}",
                batch.len(),
                i + 1,
                embedded.len()
            )));
        }
        vectors.extend(embedded);
    }

    Ok(vectors)
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Request body for the embeddings endpoint.
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Put service rows back into input order.
fn ordered_embeddings(mut data: Vec<EmbeddingDatum>, expected: usize) -> Result<Vec<Vec<f32>>> {
    data.sort_by_key(|d| d.index);

    let in_order = data.iter().enumerate().all(|(i, d)| d.index == i);
    if data.len() != expected || !in_order {
        return Err(EvalError::Embedding(format!(
            "Embedding response covers {} of {} inputs or has gaps in its indices",
            data.len(),
            expected
        )));
    }

    Ok(data.into_iter().map(|d| d.embedding).collect())
}

/// OpenAI-compatible embeddings client.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(llm: &LlmConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: llm.api_base.clone(),
            api_key: llm.api_key.clone(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        format!("{}/v1/embeddings", base)
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(EvalError::Embedding(format!(
                    "API error ({}): {}",
                    status, api_error.error.message
                )));
            }
            return Err(EvalError::Embedding(format!(
                "Request failed ({}): {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body)?;
        ordered_embeddings(parsed.data, texts.len())
    }
}

/// The embedder selected by configuration.
pub enum ConfiguredEmbedder {
    OpenAi(OpenAiEmbedder),
    #[cfg(feature = "local-embeddings")]
    Local(super::local_embeddings::LocalEmbedder),
}

impl ConfiguredEmbedder {
    pub fn from_config(llm: &LlmConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        match embedding.backend {
            EmbeddingBackend::OpenAi => Ok(Self::OpenAi(OpenAiEmbedder::new(
                llm,
                embedding.model.clone(),
            ))),
            #[cfg(feature = "local-embeddings")]
            EmbeddingBackend::Local => Ok(Self::Local(
                super::local_embeddings::LocalEmbedder::load(&embedding.model)?,
            )),
            #[cfg(not(feature = "local-embeddings"))]
            EmbeddingBackend::Local => Err(EvalError::Config(
                "Local embeddings require building with `--features local-embeddings`".to_string(),
            )),
        }
    }
}

impl Embedder for ConfiguredEmbedder {
    fn model_id(&self) -> &str {
        match self {
            Self::OpenAi(e) => e.model_id(),
            #[cfg(feature = "local-embeddings")]
            Self::Local(e) => e.model_id(),
        }
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::OpenAi(e) => e.embed_batch(texts).await,
            #[cfg(feature = "local-embeddings")]
            Self::Local(e) => e.embed_batch(texts).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::HashEmbedder;
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_dot() {
        assert!((dot(&[1.0, 2.0], &[3.0, 4.0]) - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_ordered_embeddings_restores_input_order() {
        let data = vec![
            EmbeddingDatum {
                index: 1,
                embedding: vec![1.0],
            },
            EmbeddingDatum {
                index: 0,
                embedding: vec![0.0],
            },
        ];
        let ordered = ordered_embeddings(data, 2).unwrap();
        assert_eq!(ordered, vec![vec![0.0], vec![1.0]]);
    }

    #[test]
    fn test_ordered_embeddings_rejects_gaps() {
        let data = vec![EmbeddingDatum {
            index: 1,
            embedding: vec![1.0],
        }];
        assert!(ordered_embeddings(data, 1).is_err());
    }

    #[tokio::test]
    async fn test_embed_all_is_batch_size_invariant() {
        let embedder = HashEmbedder::new(32);
        let texts = ["가나다", "형법", "정당방위", "abc", "책임능력"];

        let one = embed_all(&embedder, &texts, 1).await.unwrap();
        assert_eq!(embedder.calls.get(), 5);
        let two = embed_all(&embedder, &texts, 2).await.unwrap();
        let all = embed_all(&embedder, &texts, 128).await.unwrap();

        assert_eq!(one, two);
        assert_eq!(one, all);
        assert_eq!(one.len(), texts.len());
    }

    #[test]
    fn test_endpoint_construction() {
        let llm = LlmConfig {
            api_base: "https://api.example.com/".to_string(),
            ..Default::default()
        };
        let embedder = OpenAiEmbedder::new(&llm, "text-embedding-3-small");
        assert_eq!(embedder.endpoint(), "https://api.example.com/v1/embeddings");
        assert_eq!(embedder.model_id(), "text-embedding-3-small");
    }
}
