//! Batch evaluation of multiple-choice questions.
//!
//! This module provides:
//! - Dataset loading and schema-tolerant normalization
//! - Construction of batch chat requests with retrieved context
//! - Run directory bookkeeping and batch submission
//! - Scoring of completions against the gold ledger

pub mod batch;
pub mod dataset;
pub mod run;
pub mod scorer;
pub mod submit;

pub use batch::{BatchBuilder, BatchRequestRow, BuilderConfig, CONTEXT_TOP_K, custom_id};
pub use dataset::{AnswerLetter, CanonicalItem, Record, load_items, load_records, normalize};
pub use run::{RunDir, RunMeta};
pub use scorer::{ScoreReport, ScoringResult, extract_answer, score, score_run};
pub use submit::{POLL_INTERVAL, fetch, submit, wait_and_fetch};
