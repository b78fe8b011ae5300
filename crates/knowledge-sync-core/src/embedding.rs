//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] capability that every embedding
//! backend implements, plus pure helpers for vector serialization,
//! normalization, and similarity.
//!
//! Concrete providers (OpenAI, Ollama, fastembed) live in the
//! `knowledge-sync` app crate. Tests substitute deterministic doubles.

use anyhow::Result;
use async_trait::async_trait;

/// Capability interface for turning text into vectors.
///
/// A knowledge base depends on this trait only; it never knows which
/// backend produced its vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding dimensionality, or `0` if only known after
    /// the first call.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Encode a float vector as little-endian `f32` bytes.
///
/// # Example
///
/// ```rust
/// use knowledge_sync_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Scale a vector to unit length.
///
/// Returns `None` for empty, zero, or non-finite vectors, which cannot be
/// normalized.
pub fn normalize(vec: &[f32]) -> Option<Vec<f32>> {
    if vec.is_empty() || vec.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(vec.iter().map(|x| x / norm).collect())
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
