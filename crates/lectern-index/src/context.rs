//! Everything an ingestion or retrieval run needs, built once by the caller
//! and passed explicitly.

use std::path::PathBuf;
use std::sync::Arc;

use lectern_providers::LLMProvider;

use crate::embeddings::Embedder;
use crate::graph_builder::GraphBuilderConfig;
use crate::reranker::Reranker;
use crate::segmenter::DEFAULT_MAX_LENGTH;
use crate::storage::GraphStore;
use crate::vector_index::VectorIndex;

/// Paths and tuning knobs.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Source documents live in `<materials_dir>/<collection_id>/`
    pub materials_dir: PathBuf,
    /// Ledger, graph and local vectors live in `<knowledge_base_dir>/<collection_id>/`
    pub knowledge_base_dir: PathBuf,
    pub max_chunk_length: usize,
    /// Vector hits per query
    pub top_k: usize,
    pub graph: GraphBuilderConfig,
    /// Add 2-hop neighbours of query entities to the graph context
    pub expand_neighbors: bool,
    /// Rewrite the query with the LLM before vector search
    pub expand_query: bool,
}

impl IndexSettings {
    pub fn new(materials_dir: impl Into<PathBuf>, knowledge_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            materials_dir: materials_dir.into(),
            knowledge_base_dir: knowledge_base_dir.into(),
            max_chunk_length: DEFAULT_MAX_LENGTH,
            top_k: 5,
            graph: GraphBuilderConfig::default(),
            expand_neighbors: false,
            expand_query: false,
        }
    }

    pub fn materials_path(&self, collection_id: &str) -> PathBuf {
        self.materials_dir.join(collection_id)
    }

    pub fn collection_path(&self, collection_id: &str) -> PathBuf {
        self.knowledge_base_dir.join(collection_id)
    }
}

/// Phases of an ingestion run, with their share of overall progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Loading,
    Splitting,
    Vectorizing,
    GraphExtraction,
    Saving,
}

impl IngestStage {
    pub fn weight(&self) -> f32 {
        match self {
            IngestStage::Loading => 0.20,
            IngestStage::Splitting => 0.10,
            IngestStage::Vectorizing => 0.50,
            IngestStage::GraphExtraction => 0.15,
            IngestStage::Saving => 0.05,
        }
    }

    /// Overall progress at which this stage starts.
    pub fn offset(&self) -> f32 {
        match self {
            IngestStage::Loading => 0.0,
            IngestStage::Splitting => 0.20,
            IngestStage::Vectorizing => 0.30,
            IngestStage::GraphExtraction => 0.80,
            IngestStage::Saving => 0.95,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IngestStage::Loading => "loading",
            IngestStage::Splitting => "splitting",
            IngestStage::Vectorizing => "vectorizing",
            IngestStage::GraphExtraction => "graph extraction",
            IngestStage::Saving => "saving",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestProgress {
    pub stage: IngestStage,
    /// Overall completion, 0-100
    pub percent: f32,
    pub message: String,
}

impl IngestProgress {
    /// `fraction` is how far through `stage` the run is, 0.0-1.0.
    pub fn new(stage: IngestStage, fraction: f32, message: impl Into<String>) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        // hundredths, so a stage's end and the next stage's start compare equal
        let overall = (stage.offset() + stage.weight() * fraction).min(1.0);
        Self {
            stage,
            percent: (overall * 10_000.0).round() / 100.0,
            message: message.into(),
        }
    }
}

/// Receives progress updates during ingestion.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: IngestProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(IngestProgress) + Send + Sync,
{
    fn report(&self, progress: IngestProgress) {
        self(progress)
    }
}

/// Shared services for ingestion and retrieval.
#[derive(Clone)]
pub struct RagContext {
    pub settings: IndexSettings,
    pub embedder: Embedder,
    pub llm: Arc<dyn LLMProvider>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub graph_store: GraphStore,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl RagContext {
    pub fn new(
        settings: IndexSettings,
        embedder: Embedder,
        llm: Arc<dyn LLMProvider>,
        vector_index: Arc<dyn VectorIndex>,
    ) -> Self {
        let graph_store = GraphStore::new(settings.knowledge_base_dir.clone());
        Self {
            settings,
            embedder,
            llm,
            vector_index,
            reranker: None,
            graph_store,
            progress: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub(crate) fn report(&self, stage: IngestStage, fraction: f32, message: impl Into<String>) {
        if let Some(sink) = &self.progress {
            sink.report(IngestProgress::new(stage, fraction, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_weights_cover_whole_run() {
        let stages = [
            IngestStage::Loading,
            IngestStage::Splitting,
            IngestStage::Vectorizing,
            IngestStage::GraphExtraction,
            IngestStage::Saving,
        ];
        let total: f32 = stages.iter().map(|s| s.weight()).sum();
        assert!((total - 1.0).abs() < 1e-6);

        for pair in stages.windows(2) {
            let end = pair[0].offset() + pair[0].weight();
            assert!((end - pair[1].offset()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(IngestProgress::new(IngestStage::Loading, 0.0, "").percent, 0.0);
        let mid = IngestProgress::new(IngestStage::Vectorizing, 0.5, "half");
        assert!((mid.percent - 55.0).abs() < 1e-4);
        let done = IngestProgress::new(IngestStage::Saving, 2.0, "done");
        assert!((done.percent - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_stage_boundaries_meet_exactly() {
        let stages = [
            IngestStage::Loading,
            IngestStage::Splitting,
            IngestStage::Vectorizing,
            IngestStage::GraphExtraction,
            IngestStage::Saving,
        ];
        for pair in stages.windows(2) {
            let end = IngestProgress::new(pair[0], 1.0, "").percent;
            let start = IngestProgress::new(pair[1], 0.0, "").percent;
            assert_eq!(end, start, "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_settings_paths() {
        let settings = IndexSettings::new("/data/materials", "/data/kb");
        assert_eq!(settings.materials_path("c1"), PathBuf::from("/data/materials/c1"));
        assert_eq!(settings.collection_path("c1"), PathBuf::from("/data/kb/c1"));
        assert_eq!(settings.max_chunk_length, 300);
    }
}
