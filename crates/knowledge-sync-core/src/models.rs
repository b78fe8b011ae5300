//! Core data models shared by the store, index, and sync engine.
//!
//! A [`DocumentRecord`] is keyed by its normalized path (relative to the
//! knowledge-base root, `/`-separated). Each [`ChunkRecord`] belongs to
//! exactly one document and carries the identifier of exactly one vector
//! in the index.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a vector inside one knowledge base's index.
pub type VectorId = u64;

/// Persisted record of one source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Normalized path relative to the source root.
    pub path: String,
    /// SHA-256 (lowercase hex) of the raw file bytes.
    pub content_hash: String,
    /// Last-modified time, unix seconds.
    pub mtime: i64,
    /// Chunk identifiers in document order.
    pub chunk_ids: Vec<String>,
}

impl DocumentRecord {
    pub fn new(path: &str, content_hash: &str, mtime: i64, chunks: &[ChunkRecord]) -> Self {
        Self {
            path: path.to_string(),
            content_hash: content_hash.to_string(),
            mtime,
            chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
        }
    }
}

/// A slice of a document's text produced by the chunker.
///
/// Offsets are in characters (Unicode scalar values), half-open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Persisted chunk joined to its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_path: String,
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub vector_id: VectorId,
}

impl ChunkRecord {
    /// Build a record for a freshly chunked slice with a new UUID.
    pub fn from_text_chunk(document_path: &str, chunk: &TextChunk, vector_id: VectorId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_path: document_path.to_string(),
            chunk_index: chunk.index as i64,
            text: chunk.text.clone(),
            start_offset: chunk.start as i64,
            end_offset: chunk.end as i64,
            vector_id,
        }
    }
}

/// A ranked retrieval hit, joined with store metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_path: String,
    pub chunk_id: String,
    pub chunk_text: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
    pub start_offset: i64,
    pub end_offset: i64,
}

impl SearchHit {
    pub fn from_chunk(chunk: ChunkRecord, score: f32) -> Self {
        Self {
            document_path: chunk.document_path,
            chunk_id: chunk.id,
            chunk_text: chunk.text,
            score,
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
        }
    }
}
