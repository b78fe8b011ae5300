//! In-memory [`DocumentStore`] for tests and ephemeral knowledge bases.
//!
//! All state lives behind one `std::sync::RwLock`, so every mutation is
//! applied under a single write guard and is trivially atomic. Changesets
//! are validated before the guard mutates anything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{ChunkRecord, DocumentRecord, VectorId};

use super::{Changeset, DocumentStore, DocumentUpsert, StoreStats};

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, DocumentRecord>,
    chunks: BTreeMap<String, Vec<ChunkRecord>>,
}

impl MemoryState {
    fn remove(&mut self, path: &str) -> Option<Vec<ChunkRecord>> {
        self.documents.remove(path)?;
        Some(self.chunks.remove(path).unwrap_or_default())
    }

    /// Reject upserts whose vector ids collide with chunks that survive
    /// the changeset.
    fn check_vector_ids(&self, removals: &HashSet<&str>, upserts: &[DocumentUpsert]) -> Result<()> {
        let replaced: HashSet<&str> = upserts.iter().map(|u| u.document.path.as_str()).collect();
        let mut taken: HashMap<VectorId, &str> = HashMap::new();
        for (path, chunks) in &self.chunks {
            if removals.contains(path.as_str()) || replaced.contains(path.as_str()) {
                continue;
            }
            for c in chunks {
                taken.insert(c.vector_id, path);
            }
        }
        for upsert in upserts {
            for c in &upsert.chunks {
                if c.document_path != upsert.document.path {
                    bail!(
                        "chunk {} belongs to {}, not {}",
                        c.id,
                        c.document_path,
                        upsert.document.path
                    );
                }
                if let Some(owner) = taken.insert(c.vector_id, &upsert.document.path) {
                    bail!("vector id {} already used by {}", c.vector_id, owner);
                }
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral registries.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn upsert(&self, document: &DocumentRecord, chunks: &[ChunkRecord]) -> Result<()> {
        self.apply(&Changeset {
            removals: Vec::new(),
            upserts: vec![DocumentUpsert {
                document: document.clone(),
                chunks: chunks.to_vec(),
            }],
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<Vec<VectorId>> {
        let mut state = self.write()?;
        Ok(state
            .remove(path)
            .map(|chunks| chunks.iter().map(|c| c.vector_id).collect())
            .unwrap_or_default())
    }

    async fn apply(&self, changeset: &Changeset) -> Result<()> {
        let mut state = self.write()?;
        let removals: HashSet<&str> = changeset.removals.iter().map(String::as_str).collect();
        state.check_vector_ids(&removals, &changeset.upserts)?;

        for path in &changeset.removals {
            state.remove(path);
        }
        for upsert in &changeset.upserts {
            let path = upsert.document.path.clone();
            state.documents.insert(path.clone(), upsert.document.clone());
            state.chunks.insert(path, upsert.chunks.clone());
        }
        Ok(())
    }

    async fn snapshot_hashes(&self) -> Result<BTreeMap<String, String>> {
        let state = self.read()?;
        Ok(state
            .documents
            .iter()
            .map(|(path, doc)| (path.clone(), doc.content_hash.clone()))
            .collect())
    }

    async fn vector_refs(&self) -> Result<Vec<(String, VectorId)>> {
        let state = self.read()?;
        Ok(state
            .chunks
            .iter()
            .flat_map(|(path, chunks)| chunks.iter().map(move |c| (path.clone(), c.vector_id)))
            .collect())
    }

    async fn chunks_for_vectors(&self, ids: &[VectorId]) -> Result<Vec<ChunkRecord>> {
        let state = self.read()?;
        let wanted: HashSet<VectorId> = ids.iter().copied().collect();
        Ok(state
            .chunks
            .values()
            .flatten()
            .filter(|c| wanted.contains(&c.vector_id))
            .cloned()
            .collect())
    }

    async fn max_vector_id(&self) -> Result<Option<VectorId>> {
        let state = self.read()?;
        Ok(state.chunks.values().flatten().map(|c| c.vector_id).max())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.read()?;
        Ok(StoreStats {
            documents: state.documents.len() as u64,
            chunks: state.chunks.values().map(|c| c.len() as u64).sum(),
        })
    }
}
