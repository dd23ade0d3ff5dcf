//! Per-collection vector storage.
//!
//! Two backends implement [`VectorIndex`]: a JSON file per collection for
//! single-host deployments and tests, and Qdrant.

mod local;
mod qdrant;

pub use local::{LocalVectorIndex, VECTOR_INDEX_FILE};
pub use qdrant::{QdrantIndexConfig, QdrantVectorIndex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One indexed span of a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// `chunk_<seq>`
    pub id: String,
    pub seq: u64,
    pub text: String,
    /// Filename relative to the collection's materials directory
    pub source: String,
    /// Position within the source document, 0-based
    pub order: usize,
}

/// A chunk together with its embedding, ready for upsert.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk: ChunkRecord,
    pub vector: Vec<f32>,
}

/// A similarity search hit.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("Collection {0} has no vector index")]
    MissingCollection(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt vector index {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Vector dimension {got} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Qdrant error: {0}")]
    Qdrant(#[from] qdrant_client::QdrantError),
}

/// Storage for chunk vectors, partitioned by collection id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Whether the collection has been created.
    async fn exists(&self, collection: &str) -> Result<bool, VectorIndexError>;

    /// Create the collection if it does not exist.
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<(), VectorIndexError>;

    /// Insert or replace records by chunk id.
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), VectorIndexError>;

    /// Top `k` chunks by cosine similarity to `vector`.
    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, VectorIndexError>;

    /// Look up chunks by id. Unknown ids are skipped; order follows `ids`.
    async fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<ChunkRecord>, VectorIndexError>;

    /// Remove every chunk that came from `source`.
    async fn delete_source(&self, collection: &str, source: &str) -> Result<(), VectorIndexError>;

    /// Remove the whole collection. Missing collections are not an error.
    async fn drop_collection(&self, collection: &str) -> Result<(), VectorIndexError>;

    async fn count(&self, collection: &str) -> Result<usize, VectorIndexError>;
}

/// Parse the numeric part of a `chunk_<seq>` id.
pub fn parse_chunk_seq(id: &str) -> Option<u64> {
    id.strip_prefix("chunk_")?.parse().ok()
}
