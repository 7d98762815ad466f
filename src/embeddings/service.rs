//! High-level embedding service.
//!
//! Wraps any [`Embedder`] with bounded retry, a concurrency limit and a
//! dimension check. Cheap to clone.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use super::{Embedder, HashEmbedder, HttpEmbedder};
use crate::config::{Config, RetryPolicy};
use crate::error::EmbeddingError;
use crate::server::metrics;
use crate::Result;

/// Retrying, rate-limited front end to an [`Embedder`].
#[derive(Clone)]
pub struct EmbeddingService {
    inner: Arc<EmbeddingServiceInner>,
}

struct EmbeddingServiceInner {
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    permits: Semaphore,
    dimension: usize,
}

impl EmbeddingService {
    /// Create a service expecting `dimension`-length vectors and allowing
    /// at most `concurrency` calls in flight.
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
        concurrency: usize,
        dimension: usize,
    ) -> Self {
        Self {
            inner: Arc::new(EmbeddingServiceInner {
                embedder,
                retry,
                permits: Semaphore::new(concurrency.max(1)),
                dimension,
            }),
        }
    }

    /// Build the configured embedder: the HTTP client when an endpoint is
    /// set, the local hashing embedder otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = match &config.embed_url {
            Some(url) => {
                let client = HttpEmbedder::new(
                    url,
                    &config.embed_model,
                    config.embed_api_key.as_deref(),
                    config.embed_dim,
                    config.embed_timeout,
                )?;
                tracing::info!(endpoint = client.endpoint(), model = %config.embed_model, "Using remote embeddings");
                Arc::new(client)
            }
            None => {
                tracing::info!(dimension = config.embed_dim, "No embedding endpoint configured, using hashing embedder");
                Arc::new(HashEmbedder::new(config.embed_dim))
            }
        };

        Ok(Self::new(embedder, config.retry, config.embed_concurrency, config.embed_dim))
    }

    /// Expected vector length.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    /// Name of the wrapped embedder.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.inner.embedder.name()
    }

    /// Embed one text, retrying transient failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns the last transient error once attempts are exhausted, or the
    /// first permanent error. A vector of the wrong length is reported as
    /// [`EmbeddingError::DimensionMismatch`] and not retried.
    pub async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let max_attempts = self.inner.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = {
                let _permit = self
                    .inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| EmbeddingError::Transient("embedding service closed".to_string()))?;
                self.inner.embedder.embed(text).await
            };

            match result {
                Ok(vector) if vector.len() == self.inner.dimension => {
                    metrics::EMBEDDING_CALLS.with_label_values(&["ok"]).inc();
                    return Ok(vector);
                }
                Ok(vector) => {
                    metrics::EMBEDDING_CALLS.with_label_values(&["permanent"]).inc();
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: self.inner.dimension,
                        actual: vector.len(),
                    });
                }
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    metrics::EMBEDDING_CALLS.with_label_values(&["retried"]).inc();
                    let delay = self.inner.retry.delay_for(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Embedding failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let outcome = if e.is_transient() { "transient" } else { "permanent" };
                    metrics::EMBEDDING_CALLS.with_label_values(&[outcome]).inc();
                    return Err(e);
                }
            }
        }
    }

    /// Embed several texts concurrently, within the service's limit.
    /// Results come back in input order.
    pub async fn embed_many(
        &self,
        texts: &[&str],
    ) -> Vec<std::result::Result<Vec<f32>, EmbeddingError>> {
        join_all(texts.iter().map(|text| self.embed(text))).await
    }
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("backend", &self.backend())
            .field("dimension", &self.inner.dimension)
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}
