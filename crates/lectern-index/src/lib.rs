//! Incremental knowledge base for course documents.
//!
//! This crate provides:
//! - Structure-aware segmentation of extracted document text
//! - Change detection through a per-collection processed-file ledger
//! - Resilient batched embedding with zero-vector degradation
//! - Vector storage in a local JSON index or Qdrant
//! - An entity-relationship knowledge graph built by concurrent LLM extraction
//! - Hybrid retrieval fusing vector hits, graph provenance and graph paths,
//!   optionally reranked
//!
//! The two entry points are [`ingest`] and [`retrieve`]; both take an
//! explicit [`RagContext`].

pub mod context;
pub mod embeddings;
pub mod extraction;
pub mod graph;
pub mod graph_builder;
pub mod graph_retriever;
pub mod ingest;
pub mod ledger;
pub mod loaders;
pub mod query_expansion;
pub mod reranker;
pub mod retriever;
pub mod segmenter;
pub mod storage;
pub mod vector_index;

// Re-exports
pub use context::{IndexSettings, IngestProgress, IngestStage, ProgressSink, RagContext};
pub use embeddings::{
    EmbedOutcome, Embedder, EmbedderConfig, EmbeddingError, EmbeddingProvider, OpenAiCompatibleEmbeddings,
};
pub use extraction::{EntityExtractor, Extraction, LlmEntityExtractor, QueryEntityExtractor};
pub use graph::{EntityNode, KnowledgeGraph, RelationshipEdge};
pub use graph_builder::{GraphBuildOutcome, GraphBuilder, GraphBuilderConfig};
pub use graph_retriever::{GraphContext, GraphRetriever, PathDocument};
pub use ingest::{IngestError, IngestReport};
pub use ledger::{Ledger, LedgerError};
pub use loaders::{load_document, LoadedDocument, LoaderError};
pub use reranker::{HttpReranker, RerankResult, Reranker, RerankerDoc};
pub use retriever::{DocumentOrigin, HybridRetriever, RetrieveError, RetrievedDocument};
pub use segmenter::{segment, Segmenter};
pub use storage::{GraphMetadata, GraphStore, GraphStoreError};
pub use vector_index::{
    ChunkRecord, LocalVectorIndex, QdrantIndexConfig, QdrantVectorIndex, ScoredChunk, VectorIndex,
    VectorIndexError, VectorRecord,
};

/// Default embedding dimensions (BAAI/bge-large-zh-v1.5)
pub const DEFAULT_DIMENSIONS: usize = 1024;

/// Bring a collection's vectors, knowledge graph and ledger up to date with
/// its materials directory.
pub async fn ingest(
    ctx: &RagContext,
    collection_id: &str,
    force_rebuild: bool,
) -> Result<IngestReport, IngestError> {
    ingest::ingest(ctx, collection_id, force_rebuild).await
}

/// Answer a query with path documents first, then the fused and reranked
/// chunk pool.
pub async fn retrieve(
    ctx: &RagContext,
    query: &str,
    collection_id: &str,
) -> Result<Vec<RetrievedDocument>, RetrieveError> {
    HybridRetriever::new(ctx).retrieve(query, collection_id).await
}
