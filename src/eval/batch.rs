//! Batch request construction.
//!
//! Every normalized item becomes exactly one chat-completion request whose
//! `custom_id` is derived from the item's `idx`. Context for each request
//! is retrieved from the vector index by the question text.

use super::dataset::CanonicalItem;
use crate::error::{EvalError, Result};
use crate::llm::{CONTEXT_CHAR_BUDGET, Message, Prompts};
use crate::rag::embeddings::{Embedder, embed_all};
use crate::rag::vector_index::VectorIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// Passages retrieved per question.
pub const CONTEXT_TOP_K: usize = 3;

/// Prefix of every request's custom id.
pub const CUSTOM_ID_PREFIX: &str = "kmmlu-";

/// Join key between an item, its request and its completion.
pub fn custom_id(idx: usize) -> String {
    format!("{}{}", CUSTOM_ID_PREFIX, idx)
}

/// Body of one chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Message>,
}

/// One line of the batch request file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestRow {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: RequestBody,
}

/// Request building parameters.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Chat model named in every request.
    pub model: String,
    /// Endpoint path every request targets.
    pub url: String,
    /// Passages retrieved per question.
    pub top_k: usize,
    /// Character budget for the context block.
    pub context_budget: usize,
    /// Questions per embedding request.
    pub embed_batch_size: usize,
}

impl BuilderConfig {
    pub fn new(model: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            url: url.into(),
            top_k: CONTEXT_TOP_K,
            context_budget: CONTEXT_CHAR_BUDGET,
            embed_batch_size: 128,
        }
    }
}

/// Builds batch request rows from items and a live index.
pub struct BatchBuilder<'a, E> {
    index: &'a VectorIndex,
    embedder: &'a E,
    config: BuilderConfig,
}

impl<'a, E: Embedder> BatchBuilder<'a, E> {
    pub fn new(index: &'a VectorIndex, embedder: &'a E, config: BuilderConfig) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// Request row for one item given its retrieved passages.
    pub fn row_for<S: AsRef<str>>(&self, item: &CanonicalItem, contexts: &[S]) -> BatchRequestRow {
        let user = Prompts::answer_user(
            &item.question,
            &item.choices,
            contexts,
            self.config.context_budget,
        );

        BatchRequestRow {
            custom_id: custom_id(item.idx),
            method: "POST".to_string(),
            url: self.config.url.clone(),
            body: RequestBody {
                model: self.config.model.clone(),
                temperature: 0.0,
                messages: vec![Message::system(Prompts::answer_system()), Message::user(user)],
            },
        }
    }

    /// One row per item, in item order.
    ///
    /// Questions are embedded in batches, then each is searched on its own.
    pub async fn build(&self, items: &[CanonicalItem]) -> Result<Vec<BatchRequestRow>> {
        let questions: Vec<&str> = items.iter().map(|i| i.question.as_str()).collect();
        let query_vectors =
            embed_all(self.embedder, &questions, self.config.embed_batch_size).await?;

        let mut seen = HashSet::with_capacity(items.len());
        let mut rows = Vec::with_capacity(items.len());

        for (item, query) in items.iter().zip(&query_vectors) {
            let hits = self.index.search(query, self.config.top_k)?;
            let row = self.row_for(item, &self.index.texts(&hits));

            if !seen.insert(row.custom_id.clone()) {
                return Err(EvalError::DuplicateCustomId(row.custom_id));
            }
            rows.push(row);
        }

        info!(rows = rows.len(), "Built batch requests");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::dataset::AnswerLetter;
    use crate::llm::{ELLIPSIS, Role};
    use crate::rag::chunker::Chunk;
    use crate::rag::embeddings::testing::HashEmbedder;
    use serde_json::Map;

    fn item(idx: usize, question: &str) -> CanonicalItem {
        CanonicalItem {
            idx,
            answer: AnswerLetter::A,
            question: question.to_string(),
            choices: ["가", "나", "", ""].map(String::from),
            meta: Map::new(),
        }
    }

    async fn index(embedder: &HashEmbedder) -> VectorIndex {
        let chunks = ["정당방위의 요건", "긴급피난의 요건", "교사범의 성립", "방조범의 성립"]
            .iter()
            .map(|t| Chunk {
                text: t.to_string(),
                source_id: 0,
            })
            .collect();
        VectorIndex::build(chunks, embedder, 2).await.unwrap()
    }

    fn user_content(row: &BatchRequestRow) -> &str {
        &row.body.messages[1].content
    }

    #[test]
    fn test_custom_id_format() {
        assert_eq!(custom_id(0), "kmmlu-0");
        assert_eq!(custom_id(42), "kmmlu-42");
    }

    #[tokio::test]
    async fn test_one_row_per_item_in_order() {
        let embedder = HashEmbedder::new(32);
        let index = index(&embedder).await;
        let items = vec![
            item(0, "정당방위의 요건은?"),
            item(2, "교사범은 언제 성립하는가?"),
            item(5, "방조범의 성립 요건은?"),
        ];

        let builder = BatchBuilder::new(
            &index,
            &embedder,
            BuilderConfig::new("gpt-4o-mini", "/v1/chat/completions"),
        );
        let rows = builder.build(&items).await.unwrap();

        let ids: Vec<&str> = rows.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, vec!["kmmlu-0", "kmmlu-2", "kmmlu-5"]);

        for (row, item) in rows.iter().zip(&items) {
            assert_eq!(row.method, "POST");
            assert_eq!(row.url, "/v1/chat/completions");
            assert_eq!(row.body.model, "gpt-4o-mini");
            assert_eq!(row.body.temperature, 0.0);
            assert_eq!(row.body.messages.len(), 2);
            assert_eq!(row.body.messages[0].role, Role::System);
            assert_eq!(row.body.messages[1].role, Role::User);
            assert!(user_content(row).contains(&item.question));
            assert!(user_content(row).contains("A. 가\nB. 나\nC. \nD. \n"));
        }
        assert!(user_content(&rows[0]).contains("정당방위의 요건"));
    }

    #[tokio::test]
    async fn test_duplicate_idx_rejected() {
        let embedder = HashEmbedder::new(32);
        let index = index(&embedder).await;
        let items = vec![item(1, "a question"), item(1, "another question")];

        let builder = BatchBuilder::new(&index, &embedder, BuilderConfig::new("m", "/v1/chat/completions"));
        assert!(matches!(
            builder.build(&items).await,
            Err(EvalError::DuplicateCustomId(id)) if id == "kmmlu-1"
        ));
    }

    #[tokio::test]
    async fn test_empty_items_yield_no_rows() {
        let embedder = HashEmbedder::new(16);
        let index = index(&embedder).await;
        let builder = BatchBuilder::new(&index, &embedder, BuilderConfig::new("m", "/v1/chat/completions"));
        assert!(builder.build(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_context_bounded_by_budget() {
        let embedder = HashEmbedder::new(16);
        let index = index(&embedder).await;
        let mut config = BuilderConfig::new("m", "/v1/chat/completions");
        config.context_budget = 30;
        let builder = BatchBuilder::new(&index, &embedder, config);

        let long = "형".repeat(500);
        let row = builder.row_for(&item(3, "q"), &[long.as_str(), "tail"]);
        let content = user_content(&row);

        let context = content
            .split("[Context]\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\nReturn only").next())
            .unwrap();
        assert!(context.chars().count() <= 30);
        assert!(context.ends_with(ELLIPSIS));
        assert!(content.ends_with("Return only one letter among: A, B, C, D."));
    }

    #[test]
    fn test_row_serialization_shape() {
        let embedder = HashEmbedder::new(4);
        let index = VectorIndex::from_embeddings(
            "m",
            vec![Chunk {
                text: "x".to_string(),
                source_id: 0,
            }],
            vec![vec![1.0, 0.0, 0.0, 0.0]],
        )
        .unwrap();
        let builder = BatchBuilder::new(&index, &embedder, BuilderConfig::new("gpt-4o-mini", "/v1/chat/completions"));
        let row = builder.row_for(&item(7, "q"), &["ctx"]);

        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["custom_id"], "kmmlu-7");
        assert_eq!(v["method"], "POST");
        assert_eq!(v["url"], "/v1/chat/completions");
        assert_eq!(v["body"]["model"], "gpt-4o-mini");
        assert_eq!(v["body"]["temperature"], 0.0);
        assert_eq!(v["body"]["messages"][0]["role"], "system");
        assert_eq!(v["body"]["messages"][1]["role"], "user");
    }
}
