//! Tombstoning adapter over a [`VectorIndex`].
//!
//! Embeddings are normalized to unit length on insertion so that inner
//! product scoring equals cosine similarity. Removal marks the id as a
//! tombstone; tombstoned ids are filtered from search results until the
//! retired fraction exceeds `rebuild_ratio`, at which point the wrapped
//! index is rebuilt from the live entries.
//!
//! [`VectorIndexAdapter::apply`] validates a whole [`IndexBatch`] before
//! touching anything, so a rejected batch leaves the adapter unchanged.
//! A batch that was applied can be undone with
//! [`VectorIndexAdapter::revert`] as long as no compaction ran in between.

use std::collections::{BTreeSet, HashSet};

use crate::embedding::{blob_to_vec, normalize, vec_to_blob};
use crate::models::VectorId;

use super::{rank_order, FlatIndex, IndexError, VectorIndex};

pub const DEFAULT_REBUILD_RATIO: f32 = 0.3;

const SNAPSHOT_MAGIC: &[u8; 4] = b"KSVX";
const SNAPSHOT_VERSION: u32 = 1;

/// Removals and additions to apply together.
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    pub removals: Vec<VectorId>,
    pub additions: Vec<(VectorId, Vec<f32>)>,
}

impl IndexBatch {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }
}

/// Record of an applied batch, used to undo it.
#[derive(Debug, Clone, Default)]
pub struct AppliedBatch {
    pub removed: Vec<VectorId>,
    pub added: Vec<VectorId>,
}

pub struct VectorIndexAdapter {
    index: Box<dyn VectorIndex>,
    tombstones: BTreeSet<VectorId>,
    rebuild_ratio: f32,
}

impl VectorIndexAdapter {
    pub fn new(rebuild_ratio: f32) -> Self {
        Self::with_index(Box::new(FlatIndex::new()), rebuild_ratio)
    }

    pub fn with_index(index: Box<dyn VectorIndex>, rebuild_ratio: f32) -> Self {
        Self {
            index,
            tombstones: BTreeSet::new(),
            rebuild_ratio,
        }
    }

    pub fn dims(&self) -> Option<usize> {
        self.index.dims()
    }

    pub fn live_len(&self) -> usize {
        self.index.len() - self.tombstones.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_live(&self, id: VectorId) -> bool {
        self.index.contains(id) && !self.tombstones.contains(&id)
    }

    /// Live ids in ascending order.
    pub fn live_ids(&self) -> Vec<VectorId> {
        let mut ids: Vec<VectorId> = self
            .index
            .entries()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !self.tombstones.contains(id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Highest id ever stored, live or retired.
    pub fn max_id(&self) -> Option<VectorId> {
        self.index.entries().into_iter().map(|(id, _)| id).max()
    }

    pub fn add(&mut self, id: VectorId, embedding: &[f32]) -> Result<(), IndexError> {
        self.apply(IndexBatch {
            removals: Vec::new(),
            additions: vec![(id, embedding.to_vec())],
        })
        .map(|_| ())
    }

    pub fn remove(&mut self, id: VectorId) -> Result<(), IndexError> {
        self.apply(IndexBatch {
            removals: vec![id],
            additions: Vec::new(),
        })?;
        self.maybe_compact()?;
        Ok(())
    }

    /// Up to `top_k` live `(id, score)` pairs, best first.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(VectorId, f32)>, IndexError> {
        let query = normalize(query).ok_or(IndexError::InvalidQuery)?;
        if top_k == 0 || self.live_len() == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.index.dims() {
            if expected != query.len() {
                return Err(IndexError::DimensionMismatch {
                    id: 0,
                    expected,
                    actual: query.len(),
                });
            }
        }

        let limit = top_k.saturating_add(self.tombstones.len());
        let mut hits: Vec<(VectorId, f32)> = self
            .index
            .search(&query, limit)
            .into_iter()
            .filter(|(id, _)| !self.tombstones.contains(id))
            .collect();
        hits.sort_by(rank_order);
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Apply removals then additions, all or nothing.
    pub fn apply(&mut self, batch: IndexBatch) -> Result<AppliedBatch, IndexError> {
        let mut removing = HashSet::new();
        for &id in &batch.removals {
            if !self.is_live(id) || !removing.insert(id) {
                return Err(IndexError::UnknownVector(id));
            }
        }

        let mut dims = self.index.dims();
        let mut adding = HashSet::new();
        let mut normalized = Vec::with_capacity(batch.additions.len());
        for (id, vector) in batch.additions {
            if self.index.contains(id) || !adding.insert(id) {
                return Err(IndexError::DuplicateVector(id));
            }
            match dims {
                Some(expected) if expected != vector.len() => {
                    return Err(IndexError::DimensionMismatch {
                        id,
                        expected,
                        actual: vector.len(),
                    });
                }
                Some(_) => {}
                None => dims = Some(vector.len()),
            }
            let unit = normalize(&vector).ok_or(IndexError::InvalidVector(id))?;
            normalized.push((id, unit));
        }

        let mut applied = AppliedBatch::default();
        for id in batch.removals {
            self.tombstones.insert(id);
            applied.removed.push(id);
        }
        for (id, unit) in normalized {
            if let Err(e) = self.index.add(id, unit) {
                self.revert(applied)?;
                return Err(e);
            }
            applied.added.push(id);
        }
        Ok(applied)
    }

    /// Undo an [`apply`](Self::apply) that has not been compacted since.
    pub fn revert(&mut self, applied: AppliedBatch) -> Result<(), IndexError> {
        for id in &applied.removed {
            self.tombstones.remove(id);
        }
        if !applied.added.is_empty() {
            let added: HashSet<VectorId> = applied.added.into_iter().collect();
            let keep: Vec<(VectorId, Vec<f32>)> = self
                .index
                .entries()
                .into_iter()
                .filter(|(id, _)| !added.contains(id))
                .map(|(id, v)| (id, v.to_vec()))
                .collect();
            self.index.rebuild(keep)?;
        }
        Ok(())
    }

    pub fn needs_compaction(&self) -> bool {
        let total = self.index.len();
        total > 0 && (self.tombstones.len() as f32 / total as f32) > self.rebuild_ratio
    }

    /// Compact if the retired fraction exceeds the ratio. Returns whether
    /// a rebuild ran.
    pub fn maybe_compact(&mut self) -> Result<bool, IndexError> {
        if !self.needs_compaction() {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Rebuild the wrapped index from live entries and drop tombstones.
    pub fn compact(&mut self) -> Result<(), IndexError> {
        let live: Vec<(VectorId, Vec<f32>)> = self
            .index
            .entries()
            .into_iter()
            .filter(|(id, _)| !self.tombstones.contains(id))
            .map(|(id, v)| (id, v.to_vec()))
            .collect();
        self.index.rebuild(live)?;
        self.tombstones.clear();
        Ok(())
    }

    /// Serialize entries and tombstones (little-endian).
    ///
    /// ```text
    /// "KSVX" | version u32 | dims u32 | n u64 | n × (id u64, dims × f32)
    ///        | t u64 | t × id u64
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let dims = self.index.dims().unwrap_or(0);
        let entries = self.index.entries();
        let mut out = Vec::with_capacity(24 + entries.len() * (8 + dims * 4));
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(dims as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for (id, vector) in entries {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&vec_to_blob(vector));
        }
        out.extend_from_slice(&(self.tombstones.len() as u64).to_le_bytes());
        for id in &self.tombstones {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }

    /// Restore an adapter from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(bytes: &[u8], rebuild_ratio: f32) -> Result<Self, IndexError> {
        let mut reader = SnapshotReader { bytes, pos: 0 };
        if reader.take(4)? != SNAPSHOT_MAGIC {
            return Err(IndexError::Corrupt("bad magic".to_string()));
        }
        let version = reader.u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported version {}",
                version
            )));
        }
        let dims = reader.u32()? as usize;
        let count = reader.u64()?;

        let mut entries = Vec::new();
        for _ in 0..count {
            let id = reader.u64()?;
            let vector = blob_to_vec(reader.take(dims * 4)?);
            entries.push((id, vector));
        }

        let mut index = FlatIndex::new();
        index.rebuild(entries)?;

        let mut tombstones = BTreeSet::new();
        for _ in 0..reader.u64()? {
            let id = reader.u64()?;
            if !index.contains(id) {
                return Err(IndexError::Corrupt(format!(
                    "tombstone {} has no entry",
                    id
                )));
            }
            tombstones.insert(id);
        }
        if reader.pos != bytes.len() {
            return Err(IndexError::Corrupt("trailing bytes".to_string()));
        }

        Ok(Self {
            index: Box::new(index),
            tombstones,
            rebuild_ratio,
        })
    }
}

struct SnapshotReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| IndexError::Corrupt("truncated snapshot".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, IndexError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}
