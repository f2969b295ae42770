//! LLM integration module.
//!
//! Provides OpenAI-compatible clients for chat and batch calls and the
//! prompts used for answering questions.

pub mod batch;
mod client;
mod prompts;

pub use batch::{BatchClient, BatchJob, BatchStatus};
pub use client::{LlmClient, Message, Role};
pub use prompts::{CONTEXT_CHAR_BUDGET, ELLIPSIS, Prompts};
