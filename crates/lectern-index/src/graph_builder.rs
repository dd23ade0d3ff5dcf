//! Concurrent extraction, sequential merge.
//!
//! Chunks are processed in fixed-size batches. Inside a batch every chunk's
//! extraction runs as its own task, with a shared semaphore capping how many
//! talk to the model at once. Results are merged into the graph one by one,
//! in chunk order, so the merged graph does not depend on completion order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::extraction::{EntityExtractor, Extraction};
use crate::graph::KnowledgeGraph;
use crate::vector_index::ChunkRecord;

#[derive(Debug, Clone)]
pub struct GraphBuilderConfig {
    /// Chunks per batch
    pub batch_size: usize,
    /// Extractions in flight at once
    pub concurrency: usize,
    /// Pause between batches
    pub batch_delay: Duration,
}

impl Default for GraphBuilderConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency: 8,
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Counters for one build run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphBuildOutcome {
    pub chunks_processed: usize,
    pub extraction_failures: usize,
    pub node_count: usize,
    pub edge_count: usize,
}

pub struct GraphBuilder {
    extractor: Arc<dyn EntityExtractor>,
    config: GraphBuilderConfig,
    semaphore: Arc<Semaphore>,
}

impl GraphBuilder {
    pub fn new(extractor: Arc<dyn EntityExtractor>, config: GraphBuilderConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            extractor,
            config,
            semaphore,
        }
    }

    /// Extract every chunk and merge the results into `graph`.
    pub async fn build(
        &self,
        collection_id: &str,
        graph: &mut KnowledgeGraph,
        chunks: &[ChunkRecord],
    ) -> GraphBuildOutcome {
        self.build_with_progress(collection_id, graph, chunks, |_| {}).await
    }

    /// Like [`build`](Self::build), reporting 0-100 after every batch.
    pub async fn build_with_progress(
        &self,
        collection_id: &str,
        graph: &mut KnowledgeGraph,
        chunks: &[ChunkRecord],
        mut on_progress: impl FnMut(f32),
    ) -> GraphBuildOutcome {
        let mut outcome = GraphBuildOutcome::default();
        let batch_size = self.config.batch_size.max(1);
        let batch_count = chunks.len().div_ceil(batch_size);

        info!(
            collection = %collection_id,
            chunks = chunks.len(),
            concurrency = self.config.concurrency,
            "Building knowledge graph"
        );
        on_progress(0.0);

        for (batch_idx, batch) in chunks.chunks(batch_size).enumerate() {
            debug!(batch = batch_idx + 1, total = batch_count, "Extracting batch");

            let results = self.extract_batch(batch).await;
            for (chunk, extraction) in batch.iter().zip(&results) {
                outcome.chunks_processed += 1;
                match extraction {
                    Extraction::Success { .. } => graph.merge_extraction(&chunk.id, extraction),
                    Extraction::Failure { reason } => {
                        warn!(chunk = %chunk.id, source = %chunk.source, reason = %reason, "Extraction failed");
                        outcome.extraction_failures += 1;
                    }
                }
            }

            on_progress(((batch_idx + 1) as f32 / batch_count as f32) * 100.0);

            if batch_idx + 1 < batch_count && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        outcome.node_count = graph.node_count();
        outcome.edge_count = graph.edge_count();
        info!(
            collection = %collection_id,
            nodes = outcome.node_count,
            edges = outcome.edge_count,
            failures = outcome.extraction_failures,
            "Knowledge graph built"
        );
        if chunks.is_empty() {
            on_progress(100.0);
        }
        outcome
    }

    /// Results are returned in the order of `batch`.
    async fn extract_batch(&self, batch: &[ChunkRecord]) -> Vec<Extraction> {
        let mut handles = Vec::with_capacity(batch.len());

        for chunk in batch {
            let extractor = self.extractor.clone();
            let semaphore = self.semaphore.clone();
            let text = chunk.text.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Extraction::failure(e.to_string()),
                };
                extractor.extract(&text).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(extraction) => extraction,
                Err(e) => Extraction::failure(format!("extraction task failed: {}", e)),
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedEntity, ExtractedRelationship};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every chunk names one entity linked to a shared hub; chunks whose
    /// text contains "fail" fail. Tracks peak concurrency.
    struct HubExtractor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl HubExtractor {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EntityExtractor for HubExtractor {
        async fn extract(&self, text: &str) -> Extraction {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if text.contains("fail") {
                return Extraction::failure("model error");
            }
            Extraction::Success {
                entities: vec![ExtractedEntity {
                    name: text.to_string(),
                    entity_type: "Topic".to_string(),
                }],
                relationships: vec![ExtractedRelationship {
                    source: "HUB".to_string(),
                    target: text.to_string(),
                    label: "covers".to_string(),
                }],
            }
        }
    }

    fn chunks(texts: &[&str]) -> Vec<ChunkRecord> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| ChunkRecord {
                id: format!("chunk_{}", i),
                seq: i as u64,
                text: t.to_string(),
                source: "notes.md".to_string(),
                order: i,
            })
            .collect()
    }

    fn config(batch_size: usize, concurrency: usize) -> GraphBuilderConfig {
        GraphBuilderConfig {
            batch_size,
            concurrency,
            batch_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_build_counts_and_failures() {
        let builder = GraphBuilder::new(Arc::new(HubExtractor::new()), config(2, 4));
        let mut graph = KnowledgeGraph::new();

        let outcome = builder
            .build("c1", &mut graph, &chunks(&["alpha", "fail one", "beta"]))
            .await;

        assert_eq!(outcome.chunks_processed, 3);
        assert_eq!(outcome.extraction_failures, 1);
        assert_eq!(outcome.node_count, 3);
        assert_eq!(outcome.edge_count, 2);
        assert_eq!(graph.node("alpha").unwrap().provenance, vec!["chunk_0"]);
        assert_eq!(graph.node("beta").unwrap().provenance, vec!["chunk_2"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let extractor = Arc::new(HubExtractor::new());
        let builder = GraphBuilder::new(extractor.clone(), config(10, 3));
        let mut graph = KnowledgeGraph::new();
        let texts: Vec<String> = (0..10).map(|i| format!("topic{}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        builder.build("c1", &mut graph, &chunks(&refs)).await;

        let peak = extractor.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {} exceeded limit", peak);
        assert_eq!(graph.node_count(), 11);
    }

    #[tokio::test]
    async fn test_progress_reported_per_batch() {
        let builder = GraphBuilder::new(Arc::new(HubExtractor::new()), config(2, 2));
        let mut graph = KnowledgeGraph::new();
        let mut seen = Vec::new();

        builder
            .build_with_progress("c1", &mut graph, &chunks(&["aa", "bb", "cc"]), |p| seen.push(p))
            .await;

        assert_eq!(seen, vec![0.0, 50.0, 100.0]);
    }

    #[tokio::test]
    async fn test_result_independent_of_concurrency() {
        let texts = ["aa", "bb", "cc", "dd", "ee"];
        let mut serial = KnowledgeGraph::new();
        GraphBuilder::new(Arc::new(HubExtractor::new()), config(5, 1))
            .build("c1", &mut serial, &chunks(&texts))
            .await;
        let mut parallel = KnowledgeGraph::new();
        GraphBuilder::new(Arc::new(HubExtractor::new()), config(5, 5))
            .build("c1", &mut parallel, &chunks(&texts))
            .await;

        assert_eq!(serial.edges(), parallel.edges());
        assert_eq!(
            serde_json::to_string(&serial).unwrap(),
            serde_json::to_string(&parallel).unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let builder = GraphBuilder::new(Arc::new(HubExtractor::new()), config(5, 8));
        let mut graph = KnowledgeGraph::new();
        let outcome = builder.build("c1", &mut graph, &[]).await;
        assert_eq!(outcome, GraphBuildOutcome::default());
    }
}
