//! Document store abstraction.
//!
//! The [`DocumentStore`] trait is the persisted half of a knowledge base:
//! one record per document (path, content hash, mtime) and the chunk set
//! derived from that hash, each chunk pointing at one vector id.
//!
//! Mutations are atomic: [`upsert`](DocumentStore::upsert) replaces one
//! document, [`apply`](DocumentStore::apply) replaces everything a refresh
//! touched. Partial writes are never observable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ChunkRecord, DocumentRecord, VectorId};

/// One document's replacement record and chunk set.
#[derive(Debug, Clone)]
pub struct DocumentUpsert {
    pub document: DocumentRecord,
    pub chunks: Vec<ChunkRecord>,
}

/// Everything a refresh commits to the store, applied in one transaction:
/// removals first, then upserts.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub removals: Vec<String>,
    pub upserts: Vec<DocumentUpsert>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.upserts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
}

/// Abstract persisted document/chunk store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](DocumentStore::upsert) | Atomically replace one document and its chunks |
/// | [`remove`](DocumentStore::remove) | Delete a document, cascading to its chunks |
/// | [`apply`](DocumentStore::apply) | Atomically apply a refresh's changeset |
/// | [`snapshot_hashes`](DocumentStore::snapshot_hashes) | `(path, hash)` view for diffing |
/// | [`vector_refs`](DocumentStore::vector_refs) | Every `(path, vector id)` for reconciliation |
/// | [`chunks_for_vectors`](DocumentStore::chunks_for_vectors) | Join search hits to chunk text |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace a document's record and chunk set in one atomic step.
    async fn upsert(&self, document: &DocumentRecord, chunks: &[ChunkRecord]) -> Result<()>;

    /// Delete a document and its chunks, returning the removed vector ids.
    async fn remove(&self, path: &str) -> Result<Vec<VectorId>>;

    /// Apply removals then upserts in one atomic step.
    async fn apply(&self, changeset: &Changeset) -> Result<()>;

    async fn snapshot_hashes(&self) -> Result<BTreeMap<String, String>>;

    /// Every `(document path, vector id)` pair in the store.
    async fn vector_refs(&self) -> Result<Vec<(String, VectorId)>>;

    /// Chunks owning the given vector ids; unknown ids are skipped.
    async fn chunks_for_vectors(&self, ids: &[VectorId]) -> Result<Vec<ChunkRecord>>;

    async fn max_vector_id(&self) -> Result<Option<VectorId>>;

    async fn stats(&self) -> Result<StoreStats>;
}
