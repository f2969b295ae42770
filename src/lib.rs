//! KMMLU RAG Eval - retrieval-augmented batch evaluation of legal exam questions.
//!
//! Multiple-choice questions from the KMMLU criminal-law subset are paired
//! with passages retrieved from a small reference corpus, submitted to an
//! OpenAI-compatible batch API, and scored against their gold answers.
//!
//! # Quick Start
//!
//! ```no_run
//! use kmmlu_rag_eval::{
//!     config::Config,
//!     eval::{BatchBuilder, BuilderConfig, RunDir, load_items, score_run},
//!     persistence::IndexSource,
//!     rag::ConfiguredEmbedder,
//! };
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     // Load or build the vector index
//!     let embedder = ConfiguredEmbedder::from_config(&config.llm, &config.embedding)?;
//!     let index = IndexSource::from_config(&config).load_or_build(&embedder).await?;
//!
//!     // Normalize the dataset and write the batch input
//!     let items = load_items(Path::new("kmmlu.jsonl"), &config.dataset.category)?;
//!     let builder = BatchBuilder::new(
//!         &index,
//!         &embedder,
//!         BuilderConfig::new(&config.llm.model, &config.batch.endpoint),
//!     );
//!     let rows = builder.build(&items).await?;
//!
//!     let run = RunDir::create(&config.paths.outputs_dir, "kmmlu_criminal_law")?;
//!     run.write_batch_input(&items, &rows)?;
//!
//!     // ... submit and wait for the batch, then:
//!     let report = score_run(&run)?;
//!     println!("accuracy = {:.4}", report.result.accuracy);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **rag**: corpus chunking, embeddings and exact vector search
//! - **persistence**: on-disk index with rebuild on miss
//! - **eval**: dataset normalization, batch requests, runs and scoring
//! - **llm**: chat and batch API clients, prompts

pub mod config;
pub mod error;
pub mod eval;
pub mod llm;
pub mod persistence;
pub mod rag;

// Re-export commonly used types
pub use config::Config;
pub use error::{EvalError, Result};
pub use eval::{BatchBuilder, CanonicalItem, RunDir, ScoringResult};
pub use llm::{BatchClient, LlmClient};
pub use persistence::{IndexSource, load_index, save_index};
pub use rag::{Chunk, ConfiguredEmbedder, VectorIndex};
