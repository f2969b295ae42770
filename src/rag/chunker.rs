//! Fixed-window text chunking.

use super::corpus::RawDocument;
use serde::{Deserialize, Serialize};

/// Configuration for text chunking.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Maximum characters per chunk.
    pub max_chars: usize,
    /// Characters repeated at the start of the next window.
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 700,
            overlap: 100,
        }
    }
}

impl ChunkConfig {
    /// Distance between consecutive window starts. Always at least 1.
    pub fn step(&self) -> usize {
        self.max_chars.saturating_sub(self.overlap).max(1)
    }
}

/// A retrievable slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk text content.
    pub text: String,
    /// Position of the originating document in the corpus.
    pub source_id: usize,
}

/// Collapse every run of spaces, carriage returns and newlines into one space.
pub fn clean_text(text: &str) -> String {
    text.split(|c: char| c == ' ' || c == '\r' || c == '\n')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split one document into overlapping character windows.
///
/// Offsets are counted in characters of the cleaned text, never bytes,
/// so multi-byte scripts split on character boundaries.
pub fn split_chunks(text: &str, config: &ChunkConfig) -> Vec<String> {
    let cleaned = clean_text(text);
    let chars: Vec<char> = cleaned.chars().collect();
    let n = chars.len();
    let window = config.max_chars.max(1);
    let step = config.step();

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < n {
        let end = (start + window).min(n);
        let chunk: String = chars[start..end].iter().collect();

        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }

        if end >= n {
            break;
        }
        start += step;
    }

    chunks
}

/// Chunk every document, tagging each chunk with its document position.
pub fn chunk_documents(documents: &[RawDocument], config: &ChunkConfig) -> Vec<Chunk> {
    documents
        .iter()
        .flat_map(|doc| {
            split_chunks(&doc.text, config)
                .into_iter()
                .map(move |text| Chunk {
                    text,
                    source_id: doc.source_id,
                })
        })
        .collect()
}
