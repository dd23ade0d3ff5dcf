//! Hybrid retrieval: vector search fused with graph search, then reranked.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::RagContext;
use crate::graph::KnowledgeGraph;
use crate::graph_retriever::{GraphContext, GraphRetriever, PathDocument};
use crate::query_expansion::QueryExpander;
use crate::reranker::RerankerDoc;
use crate::vector_index::{ChunkRecord, VectorIndexError};

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("Collection {collection} has not been ingested")]
    NotIngested { collection: String },

    #[error("Vector index error: {0}")]
    Index(#[from] VectorIndexError),
}

/// Where a retrieved document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOrigin {
    /// Vector similarity hit
    Vector,
    /// Provenance chunk of a query entity or path node
    Graph,
    /// Rendered graph path, not a stored chunk
    GraphPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedDocument {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    /// `None` for path documents
    pub chunk_id: Option<String>,
    /// Cosine similarity for vector hits
    pub score: Option<f32>,
    /// Set when the reranker scored this document
    pub rerank_score: Option<f32>,
    pub origin: DocumentOrigin,
}

impl RetrievedDocument {
    fn from_chunk(chunk: ChunkRecord, score: Option<f32>, origin: DocumentOrigin) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), chunk.source);
        metadata.insert("chunk_id".to_string(), chunk.id.clone());
        metadata.insert("order".to_string(), chunk.order.to_string());
        Self {
            text: chunk.text,
            metadata,
            chunk_id: Some(chunk.id),
            score,
            rerank_score: None,
            origin,
        }
    }

    fn from_path(doc: PathDocument) -> Self {
        Self {
            text: doc.text,
            metadata: doc.metadata,
            chunk_id: None,
            score: None,
            rerank_score: None,
            origin: DocumentOrigin::GraphPath,
        }
    }
}

pub struct HybridRetriever<'a> {
    ctx: &'a RagContext,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(ctx: &'a RagContext) -> Self {
        Self { ctx }
    }

    pub async fn retrieve(&self, query: &str, collection_id: &str) -> Result<Vec<RetrievedDocument>, RetrieveError> {
        let index = &self.ctx.vector_index;
        if !index.exists(collection_id).await? {
            return Err(RetrieveError::NotIngested {
                collection: collection_id.to_string(),
            });
        }

        // vector search
        let search_query = if self.ctx.settings.expand_query {
            QueryExpander::new(self.ctx.llm.clone()).expand(query).await
        } else {
            query.to_string()
        };
        let vector = self.ctx.embedder.embed_query(&search_query).await;
        let hits = index
            .query(collection_id, &vector, self.ctx.settings.top_k)
            .await?;
        debug!(collection = %collection_id, hits = hits.len(), "Vector search complete");

        // graph search
        let graph_context = match self.load_graph(collection_id) {
            Some(graph) => {
                GraphRetriever::new(self.ctx.llm.clone(), self.ctx.settings.expand_neighbors)
                    .query_graph(query, &graph)
                    .await
            }
            None => GraphContext::default(),
        };

        // fuse
        let mut seen: HashSet<String> = HashSet::new();
        let mut pool: Vec<RetrievedDocument> = Vec::new();
        for hit in hits {
            if seen.insert(hit.chunk.id.clone()) {
                pool.push(RetrievedDocument::from_chunk(
                    hit.chunk,
                    Some(hit.score),
                    DocumentOrigin::Vector,
                ));
            }
        }
        let graph_ids: Vec<String> = graph_context
            .chunk_ids
            .iter()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        if !graph_ids.is_empty() {
            for chunk in index.fetch(collection_id, &graph_ids).await? {
                if seen.insert(chunk.id.clone()) {
                    pool.push(RetrievedDocument::from_chunk(chunk, None, DocumentOrigin::Graph));
                }
            }
        }

        let pool = self.rerank(query, pool).await;

        let mut results: Vec<RetrievedDocument> = graph_context
            .path_documents
            .into_iter()
            .map(RetrievedDocument::from_path)
            .collect();
        results.extend(pool);

        info!(collection = %collection_id, documents = results.len(), "Retrieval complete");
        Ok(results)
    }

    /// Missing or unreadable graphs degrade to vector-only retrieval.
    fn load_graph(&self, collection_id: &str) -> Option<KnowledgeGraph> {
        match self.ctx.graph_store.load(collection_id) {
            Ok(Some(graph)) => Some(graph),
            Ok(None) => {
                info!(collection = %collection_id, "No knowledge graph, using vector search only");
                None
            }
            Err(e) => {
                warn!(collection = %collection_id, error = %e, "Failed to load knowledge graph, using vector search only");
                None
            }
        }
    }

    async fn rerank(&self, query: &str, pool: Vec<RetrievedDocument>) -> Vec<RetrievedDocument> {
        let Some(reranker) = &self.ctx.reranker else {
            return pool;
        };
        if pool.len() <= 1 {
            return pool;
        }

        let docs: Vec<RerankerDoc> = pool
            .iter()
            .enumerate()
            .map(|(i, d)| RerankerDoc {
                id: d.chunk_id.clone().unwrap_or_else(|| i.to_string()),
                content: d.text.clone(),
            })
            .collect();

        match reranker.rerank(query, &docs).await {
            Ok(results) => {
                let scores: Vec<(String, f32)> = results.into_iter().map(|r| (r.id, r.score)).collect();
                apply_rerank(pool, &docs, &scores)
            }
            Err(e) => {
                warn!(error = %e, "Rerank failed, keeping retrieval order");
                pool
            }
        }
    }
}

/// Scored documents in score order, then unscored ones in their original
/// relative order.
fn apply_rerank(pool: Vec<RetrievedDocument>, docs: &[RerankerDoc], scores: &[(String, f32)]) -> Vec<RetrievedDocument> {
    let mut slots: HashMap<&str, usize> = docs.iter().enumerate().map(|(i, d)| (d.id.as_str(), i)).collect();
    let mut pool: Vec<Option<RetrievedDocument>> = pool.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(pool.len());

    for (id, score) in scores {
        if let Some(slot) = slots.remove(id.as_str()) {
            if let Some(mut doc) = pool[slot].take() {
                doc.rerank_score = Some(*score);
                ordered.push(doc);
            }
        }
    }
    ordered.extend(pool.into_iter().flatten());
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> RetrievedDocument {
        RetrievedDocument::from_chunk(
            ChunkRecord {
                id: id.to_string(),
                seq: 0,
                text: id.to_string(),
                source: "a.md".to_string(),
                order: 0,
            },
            None,
            DocumentOrigin::Vector,
        )
    }

    fn ids(docs: &[RetrievedDocument]) -> Vec<&str> {
        docs.iter().filter_map(|d| d.chunk_id.as_deref()).collect()
    }

    #[test]
    fn test_apply_rerank_partial_scores() {
        let pool = vec![doc("chunk_0"), doc("chunk_1"), doc("chunk_2"), doc("chunk_3")];
        let docs: Vec<RerankerDoc> = pool
            .iter()
            .map(|d| RerankerDoc {
                id: d.chunk_id.clone().unwrap(),
                content: d.text.clone(),
            })
            .collect();
        let scores = vec![
            ("chunk_2".to_string(), 0.9),
            ("chunk_0".to_string(), 0.5),
            ("chunk_2".to_string(), 0.1),
            ("unknown".to_string(), 0.4),
        ];

        let reranked = apply_rerank(pool, &docs, &scores);
        assert_eq!(ids(&reranked), vec!["chunk_2", "chunk_0", "chunk_1", "chunk_3"]);
        assert_eq!(reranked[0].rerank_score, Some(0.9));
        assert_eq!(reranked[2].rerank_score, None);
    }

    #[test]
    fn test_from_path_document() {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "knowledge_graph_path".to_string());
        let doc = RetrievedDocument::from_path(PathDocument {
            text: "Found a reasoning path: AA -> BB".to_string(),
            path: vec!["AA".to_string(), "BB".to_string()],
            labels: vec!["r".to_string()],
            metadata,
        });
        assert_eq!(doc.origin, DocumentOrigin::GraphPath);
        assert!(doc.chunk_id.is_none());
    }
}
