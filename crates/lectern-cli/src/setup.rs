//! Turns a [`Config`] into a ready [`RagContext`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lectern_config::{resolve_api_key, resolve_api_key_optional, Config, VectorBackend};
use lectern_index::{
    Embedder, EmbedderConfig, GraphBuilderConfig, HttpReranker, IndexSettings, LocalVectorIndex,
    OpenAiCompatibleEmbeddings, QdrantIndexConfig, QdrantVectorIndex, RagContext, VectorIndex,
};
use lectern_providers::OpenAiCompatibleProvider;
use tracing::{debug, info};

/// Pipeline settings derived from the config file.
pub fn settings_from_config(config: &Config) -> IndexSettings {
    let mut settings = IndexSettings::new(
        config.storage.materials_dir.clone(),
        config.storage.knowledge_base_dir.clone(),
    );
    settings.max_chunk_length = config.chunking.max_length;
    settings.top_k = config.retrieval.top_k;
    settings.expand_query = config.retrieval.expand_query;
    settings.expand_neighbors = config.graph.expand_neighbors;
    settings.graph = GraphBuilderConfig {
        batch_size: config.graph.batch_size,
        concurrency: config.graph.concurrency,
        batch_delay: Duration::from_millis(config.graph.batch_delay_ms),
    };
    settings
}

fn embedder_config(config: &Config) -> EmbedderConfig {
    EmbedderConfig {
        dimensions: config.embeddings.dimensions,
        batch_size: config.embeddings.batch_size,
        max_retries: config.embeddings.max_retries,
        base_delay: Duration::from_millis(config.embeddings.retry_base_delay_ms),
        ..EmbedderConfig::default()
    }
}

/// Build every client the pipeline needs. Nothing is contacted yet.
pub fn build_context(config: &Config) -> Result<RagContext> {
    let embeddings = &config.embeddings;
    let provider = OpenAiCompatibleEmbeddings::new(
        &embeddings.base_url,
        resolve_api_key(&embeddings.api_key)?,
        embeddings.model.clone(),
        embeddings.dimensions,
        Duration::from_secs(embeddings.timeout_secs),
    )
    .context("Failed to create embedding client")?;
    let embedder = Embedder::new(Arc::new(provider), embedder_config(config));

    let llm = &config.llm;
    let chat = OpenAiCompatibleProvider::with_timeout(
        llm.base_url.clone(),
        resolve_api_key(&llm.api_key)?,
        llm.model.clone(),
        Duration::from_secs(llm.timeout_secs),
    )
    .context("Failed to create chat client")?
    .with_defaults(llm.max_tokens, Some(llm.temperature));

    let store = &config.vector_store;
    let vector_index: Arc<dyn VectorIndex> = match store.backend {
        VectorBackend::Local => {
            debug!(root = ?config.storage.knowledge_base_dir, "Using local vector index");
            Arc::new(LocalVectorIndex::new(config.storage.knowledge_base_dir.clone()))
        }
        VectorBackend::Qdrant => {
            info!(url = %store.qdrant_url, "Using Qdrant vector index");
            let qdrant = QdrantVectorIndex::connect(&QdrantIndexConfig {
                url: store.qdrant_url.clone(),
                api_key: resolve_api_key_optional(&store.qdrant_api_key),
                collection_prefix: store.collection_prefix.clone(),
            })
            .context("Failed to connect to Qdrant")?;
            Arc::new(qdrant)
        }
    };

    let mut ctx = RagContext::new(settings_from_config(config), embedder, Arc::new(chat), vector_index);

    let rerank = &config.rerank;
    if rerank.enabled {
        let reranker = HttpReranker::new(
            rerank.base_url.clone(),
            rerank.model.clone(),
            resolve_api_key(&rerank.api_key)?,
            Duration::from_secs(rerank.timeout_secs),
        )
        .context("Failed to create rerank client")?
        .with_top_n(rerank.top_n);
        ctx = ctx.with_reranker(Arc::new(reranker));
    }

    Ok(ctx)
}
