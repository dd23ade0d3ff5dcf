//! Batching, retry and degradation on top of an [`EmbeddingProvider`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{EmbeddingError, EmbeddingProvider};

/// Retry and batching policy.
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Dimension every returned vector is coerced to
    pub dimensions: usize,
    /// Texts per request
    pub batch_size: usize,
    /// Attempts per batch before falling back to zero vectors
    pub max_retries: u32,
    /// Delay before the second attempt; doubles after every failure
    pub base_delay: Duration,
    /// Ceiling for any single delay, including server `retry-after`
    pub max_delay: Duration,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: crate::DEFAULT_DIMENSIONS,
            batch_size: 5,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Result of embedding a list of texts.
#[derive(Debug, Clone, Default)]
pub struct EmbedOutcome {
    /// One vector per input text, in input order
    pub vectors: Vec<Vec<f32>>,
    /// How many of them are zero placeholders
    pub degraded: usize,
}

/// Resilient embedding client.
///
/// Never fails: a batch that cannot be embedded after all retries is
/// replaced by zero vectors of the configured dimension.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbedderConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbedderConfig) -> Self {
        Self { provider, config }
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    fn batch_size(&self) -> usize {
        self.config
            .batch_size
            .min(self.provider.max_batch_size())
            .max(1)
    }

    /// Embed `texts`, one vector per text.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        self.embed_with_report(texts).await.vectors
    }

    /// Embed `texts` and report how many vectors are degraded.
    pub async fn embed_with_report(&self, texts: &[String]) -> EmbedOutcome {
        let mut outcome = EmbedOutcome {
            vectors: Vec::with_capacity(texts.len()),
            degraded: 0,
        };

        for (batch_idx, batch) in texts.chunks(self.batch_size()).enumerate() {
            match self.embed_batch_with_retry(batch_idx, batch).await {
                Some(vectors) => outcome.vectors.extend(vectors),
                None => {
                    warn!(
                        batch = batch_idx,
                        size = batch.len(),
                        "Embedding batch failed after all retries, using zero vectors"
                    );
                    outcome.degraded += batch.len();
                    outcome
                        .vectors
                        .extend(std::iter::repeat_with(|| self.zero_vector()).take(batch.len()));
                }
            }
        }

        outcome
    }

    /// Embed a single query string with the same retry and fallback rules.
    pub async fn embed_query(&self, text: &str) -> Vec<f32> {
        if text.trim().is_empty() {
            return self.zero_vector();
        }
        let texts = [text.to_string()];
        self.embed(&texts)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| self.zero_vector())
    }

    fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.config.dimensions]
    }

    async fn embed_batch_with_retry(&self, batch_idx: usize, batch: &[String]) -> Option<Vec<Vec<f32>>> {
        let attempts = self.config.max_retries.max(1);

        for attempt in 0..attempts {
            let retry_after = match self.provider.embed_batch(batch).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    debug!(batch = batch_idx, attempt, "Embedding batch succeeded");
                    return Some(
                        vectors
                            .into_iter()
                            .map(|v| coerce_dimension(v, self.config.dimensions))
                            .collect(),
                    );
                }
                Ok(vectors) => {
                    warn!(
                        batch = batch_idx,
                        attempt,
                        expected = batch.len(),
                        got = vectors.len(),
                        "Embedding response count mismatch"
                    );
                    None
                }
                Err(e) => {
                    warn!(batch = batch_idx, attempt, error = %e, "Embedding request failed");
                    match e.downcast_ref::<EmbeddingError>() {
                        Some(EmbeddingError::RateLimited(Some(secs))) => Some(Duration::from_secs(*secs)),
                        _ => None,
                    }
                }
            };

            if attempt + 1 < attempts {
                let delay = retry_after
                    .unwrap_or_else(|| self.backoff(attempt))
                    .min(self.config.max_delay);
                tokio::time::sleep(delay).await;
            }
        }

        None
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Pad with zeros or truncate to exactly `dimensions`; non-finite values
/// become zero.
pub fn coerce_dimension(mut vector: Vec<f32>, dimensions: usize) -> Vec<f32> {
    if vector.len() != dimensions {
        debug!(got = vector.len(), expected = dimensions, "Coercing embedding dimension");
        vector.resize(dimensions, 0.0);
    }
    for value in vector.iter_mut() {
        if !value.is_finite() {
            *value = 0.0;
        }
    }
    vector
}
