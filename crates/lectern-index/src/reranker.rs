//! Cross-encoder reranking over an HTTP `/rerank` endpoint.
//!
//! Speaks the Jina/Cohere-style protocol served by SiliconFlow, TEI and
//! vLLM: `{model, query, documents}` in, `{results: [{index,
//! relevance_score}]}` out.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest document text sent to the service, in characters.
const MAX_DOC_CHARS: usize = 4000;

/// A document to be reranked.
#[derive(Debug, Clone)]
pub struct RerankerDoc {
    pub id: String,
    pub content: String,
}

/// Score for one submitted document.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    pub id: String,
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score documents against a query, best first. The service may
    /// omit documents it did not score.
    async fn rerank(&self, query: &str, documents: &[RerankerDoc]) -> Result<Vec<RerankResult>>;
}

pub struct HttpReranker {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    top_n: Option<usize>,
}

impl HttpReranker {
    pub fn new(base_url: String, model: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for reranker")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            top_n: None,
        })
    }

    pub fn with_top_n(mut self, top_n: Option<usize>) -> Self {
        self.top_n = top_n;
        self
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_n: Option<usize>,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f32,
}

/// Map service indices back to document ids, best score first.
fn map_results(items: Vec<RerankItem>, documents: &[RerankerDoc]) -> Result<Vec<RerankResult>> {
    let mut results = items
        .into_iter()
        .map(|item| {
            documents
                .get(item.index)
                .map(|doc| RerankResult {
                    id: doc.id.clone(),
                    score: item.relevance_score,
                })
                .ok_or_else(|| {
                    anyhow!(
                        "rerank index {} out of range for {} documents",
                        item.index,
                        documents.len()
                    )
                })
        })
        .collect::<Result<Vec<_>>>()?;
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(results)
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[RerankerDoc]) -> Result<Vec<RerankResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/rerank", self.base_url);
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: documents
                .iter()
                .map(|d| d.content.chars().take(MAX_DOC_CHARS).collect())
                .collect(),
            top_n: self.top_n,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder.send().await.context("Rerank request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Rerank API returned {}: {}", status, body));
        }
        let parsed: RerankResponse = response
            .json()
            .await
            .context("Failed to parse rerank response")?;

        debug!(documents = documents.len(), scored = parsed.results.len(), "Rerank complete");
        map_results(parsed.results, documents)
    }
}
