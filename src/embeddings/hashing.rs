//! Local embedder based on feature hashing.
//!
//! Each lower-cased word is hashed into one signed bucket, so texts sharing
//! words end up close in cosine distance. No network, no model files;
//! useful for development and tests.

use async_trait::async_trait;

use super::{l2_normalize, Embedder};
use crate::error::EmbeddingError;

/// Deterministic bag-of-words embedder.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    /// Create an embedder producing `dimension`-length vectors.
    #[must_use]
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Embed synchronously.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut index = [0u8; 8];
            index.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(index) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            fill_from_seed(&mut vector, text);
        }

        l2_normalize(&mut vector);
        vector
    }
}

/// Pseudo-random vector for text without words, so it is never all zeros.
#[allow(clippy::cast_precision_loss)]
fn fill_from_seed(vector: &mut [f32], text: &str) {
    let digest = blake3::hash(text.as_bytes());
    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(&digest.as_bytes()[..8]);
    let mut seed = u64::from_le_bytes(seed_bytes);

    for value in vector.iter_mut() {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        *value = (((seed >> 33) as f32) / (u32::MAX as f32)).mul_add(2.0, -1.0);
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}
