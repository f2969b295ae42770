//! Retrieval over the reference corpus.
//!
//! Raw documents are cleaned and cut into overlapping windows, embedded,
//! and searched exhaustively by cosine similarity.

pub mod chunker;
pub mod corpus;
pub mod embeddings;
#[cfg(feature = "local-embeddings")]
pub mod local_embeddings;
pub mod vector_index;

pub use chunker::{Chunk, ChunkConfig, chunk_documents, split_chunks};
pub use corpus::{RawDocument, load_documents};
pub use embeddings::{ConfiguredEmbedder, Embedder, OpenAiEmbedder, embed_all};
pub use vector_index::{SearchHit, VectorIndex};
