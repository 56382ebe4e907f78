use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::codec::l2_normalize;
use crate::errors::EmbeddingError;

/// Produces fixed-dimension vectors for text. The model behind it is an
/// external collaborator; implementations load lazily and cache for process
/// lifetime.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;
}

/// Deterministic embedder: SHA-256 of the input seeds the vector components.
/// Used under LLM_MOCK and in tests; semantically meaningless but stable,
/// unit-length, and collision-poor enough for ranking assertions.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();

        let mut v: Vec<f32> = (0..self.dims)
            .map(|i| {
                // Rotate through the digest, re-hashing per 32-byte window
                // so dims > 32 stay decorrelated.
                let window = i / hash.len();
                let byte = if window == 0 {
                    hash[i % hash.len()]
                } else {
                    let mut h = Sha256::new();
                    h.update(hash.as_slice());
                    h.update([window as u8]);
                    h.finalize()[i % 32]
                };
                (f32::from(byte) / 127.5) - 1.0
            })
            .collect();
        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
