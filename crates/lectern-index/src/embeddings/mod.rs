//! Embedding provider trait and implementations.
//!
//! [`EmbeddingProvider`] is the raw transport: one call, one batch, errors
//! surfaced as-is. [`Embedder`] wraps a provider with batching, retries,
//! zero-vector degradation and dimension coercion, and is what the rest of
//! the crate uses.

mod resilient;

pub use resilient::{coerce_dimension, EmbedOutcome, Embedder, EmbedderConfig};

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited, retry after {0:?} seconds")]
    RateLimited(Option<u64>),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed multiple texts in one request
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding returned".to_string()).into())
    }

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Embedding provider for any OpenAI-compatible `/embeddings` endpoint
/// (SiliconFlow, vLLM, Ollama, OpenAI).
pub struct OpenAiCompatibleEmbeddings {
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: Client,
    endpoint: String,
}

impl OpenAiCompatibleEmbeddings {
    /// `base_url` is the API root, e.g. `https://api.siliconflow.cn/v1`.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

        Ok(Self {
            api_key,
            model,
            dimensions,
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
        })
    }

    /// Override the full endpoint URL (useful for testing or proxies).
    pub fn with_endpoint(mut self, url: String) -> Self {
        self.endpoint = url;
        self
    }

    async fn send_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        };

        debug!(
            "Sending embedding request for {} texts to {}",
            texts.len(),
            self.endpoint
        );

        let mut req_builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&request_body);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return Err(EmbeddingError::RateLimited(retry_after).into());
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        Ok(order_by_index(embedding_response.data))
    }
}

/// Sort by the `index` field when every item carries one.
fn order_by_index(data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    if data.iter().all(|d| d.index.is_some()) {
        let mut indexed: Vec<(usize, Vec<f32>)> = data
            .into_iter()
            .map(|d| (d.index.unwrap_or_default(), d.embedding))
            .collect();
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, emb)| emb).collect()
    } else {
        data.into_iter().map(|d| d.embedding).collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.send_request(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatibleEmbeddings {
        OpenAiCompatibleEmbeddings::new(
            "https://api.siliconflow.cn/v1/",
            Some("test-key".to_string()),
            "BAAI/bge-large-zh-v1.5".to_string(),
            1024,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn test_provider_creation() {
        let provider = provider();
        assert_eq!(provider.dimensions(), 1024);
        assert_eq!(provider.model_name(), "BAAI/bge-large-zh-v1.5");
        assert_eq!(provider.endpoint, "https://api.siliconflow.cn/v1/embeddings");
        assert_eq!(provider.max_batch_size(), 32);
    }

    #[test]
    fn test_provider_with_endpoint() {
        let provider = provider().with_endpoint("http://localhost:8080/embed".to_string());
        assert_eq!(provider.endpoint, "http://localhost:8080/embed");
    }

    #[test]
    fn test_request_shape() {
        let input = vec!["a".to_string(), "b".to_string()];
        let body = serde_json::to_value(EmbeddingRequest {
            model: "m",
            input: &input,
            encoding_format: "float",
        })
        .unwrap();
        assert_eq!(body["model"], "m");
        assert_eq!(body["input"][1], "b");
        assert_eq!(body["encoding_format"], "float");
    }

    #[test]
    fn test_response_sorted_by_index() {
        let raw = r#"{"data":[{"embedding":[2.0],"index":1},{"embedding":[1.0],"index":0}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(order_by_index(parsed.data), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_response_without_index_keeps_order() {
        let raw = r#"{"data":[{"embedding":[2.0]},{"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(order_by_index(parsed.data), vec![vec![2.0], vec![1.0]]);
    }
}
