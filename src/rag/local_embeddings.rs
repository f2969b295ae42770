//! Local sentence-transformers embeddings using candle.
//!
//! Only compiled with the `local-embeddings` feature. Lets the index be
//! built and queried without a remote embedding service.

use super::embeddings::Embedder;
use crate::error::{EvalError, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::Tokenizer;

fn model_error(context: &str, err: impl std::fmt::Display) -> EvalError {
    EvalError::Embedding(format!("{}: {}", context, err))
}

/// Mean-pooled BERT embedder loaded from the Hugging Face Hub.
pub struct LocalEmbedder {
    model_id: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl LocalEmbedder {
    /// Load a sentence-transformers model by repository id.
    pub fn load(model_id: &str) -> Result<Self> {
        let device = Device::Cpu;

        let api = Api::new().map_err(|e| model_error("Failed to create HF Hub API", e))?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .map_err(|e| model_error("Failed to get config.json", e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| model_error("Failed to get tokenizer.json", e))?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| model_error("Failed to get model weights", e))?;

        let raw_config =
            std::fs::read_to_string(&config_path).map_err(|e| EvalError::io(&config_path, e))?;
        let config: BertConfig = serde_json::from_str(&raw_config)
            .map_err(|e| model_error("Failed to parse model config", e))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| model_error("Failed to load tokenizer", e))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)
                .map_err(|e| model_error("Failed to load model weights", e))?
        };

        let model =
            BertModel::load(vb, &config).map_err(|e| model_error("Failed to load BERT model", e))?;

        Ok(Self {
            model_id: model_id.to_string(),
            model,
            tokenizer,
            device,
        })
    }

    fn embed_sync(&self, texts: &[&str]) -> std::result::Result<Vec<Vec<f32>>, candle_core::Error> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(candle_core::Error::msg)?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);

        let mut input_ids = Vec::with_capacity(texts.len() * max_len);
        let mut attention_mask = Vec::with_capacity(texts.len() * max_len);

        for encoding in &encodings {
            let mut ids = encoding.get_ids().to_vec();
            let mut mask = encoding.get_attention_mask().to_vec();
            ids.resize(max_len, 0);
            mask.resize(max_len, 0);
            input_ids.extend(ids);
            attention_mask.extend(mask);
        }

        let shape = (texts.len(), max_len);
        let input_ids = Tensor::from_vec(input_ids, shape, &self.device)?;
        let attention_mask = Tensor::from_vec(attention_mask, shape, &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let output = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean pooling over tokens, ignoring padding.
        let mask = attention_mask
            .unsqueeze(2)?
            .to_dtype(output.dtype())?
            .broadcast_as(output.shape())?;
        let summed = (output * &mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
        let pooled = (summed / counts)?;

        pooled.to_vec2::<f32>()
    }
}

impl Embedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed_sync(texts)
            .map_err(|e| model_error("Local embedding failed", e))
    }
}
