//! Embedding generation.
//!
//! This module provides:
//! - The [`Embedder`] collaborator trait
//! - An HTTP client for OpenAI-compatible `/embeddings` endpoints
//! - A local feature-hashing embedder used when no endpoint is configured
//! - [`EmbeddingService`], which adds retry, concurrency limits and
//!   dimension checks on top of any embedder

mod client;
mod hashing;
mod service;

use async_trait::async_trait;

pub use client::HttpEmbedder;
pub use hashing::HashEmbedder;
pub use service::EmbeddingService;

use crate::error::EmbeddingError;

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Transient`] when a retry may succeed and
    /// [`EmbeddingError::Permanent`] otherwise.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError>;

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "embedder"
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
