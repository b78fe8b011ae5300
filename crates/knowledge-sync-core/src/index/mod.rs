//! Vector index abstraction.
//!
//! [`VectorIndex`] models the external nearest-neighbor library: it can
//! add vectors, search them, enumerate them, and be rebuilt from scratch,
//! but it cannot delete in place. [`FlatIndex`] is the bundled brute-force
//! inner-product implementation.
//!
//! Deletion, normalization, and batch atomicity are layered on top by
//! [`VectorIndexAdapter`].

mod adapter;

pub use adapter::{AppliedBatch, IndexBatch, VectorIndexAdapter, DEFAULT_REBUILD_RATIO};

use std::cmp::Ordering;
use std::collections::HashMap;

use thiserror::Error;

use crate::embedding::dot;
use crate::models::VectorId;

/// Rejections raised by the index or its adapter.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("vector {id} has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        id: VectorId,
        expected: usize,
        actual: usize,
    },
    #[error("vector {0} already exists in the index")]
    DuplicateVector(VectorId),
    #[error("vector {0} is not live in the index")]
    UnknownVector(VectorId),
    #[error("vector {0} is empty, zero, or not finite")]
    InvalidVector(VectorId),
    #[error("query vector is empty, zero, or not finite")]
    InvalidQuery,
    #[error("corrupt index snapshot: {0}")]
    Corrupt(String),
    #[error("index persistence failed: {0}")]
    Persist(String),
}

/// Minimal surface of a nearest-neighbor library.
pub trait VectorIndex: Send + Sync {
    /// Dimensionality fixed by the first insertion.
    fn dims(&self) -> Option<usize>;

    /// Number of stored vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: VectorId) -> bool;

    fn add(&mut self, id: VectorId, vector: Vec<f32>) -> Result<(), IndexError>;

    /// Top `limit` entries by inner product, descending score then
    /// ascending id.
    fn search(&self, query: &[f32], limit: usize) -> Vec<(VectorId, f32)>;

    /// All stored entries in insertion order.
    fn entries(&self) -> Vec<(VectorId, &[f32])>;

    /// Replace the contents wholesale.
    fn rebuild(&mut self, entries: Vec<(VectorId, Vec<f32>)>) -> Result<(), IndexError>;
}

/// Brute-force inner-product index over a contiguous buffer.
#[derive(Debug, Default, Clone)]
pub struct FlatIndex {
    dims: Option<usize>,
    ids: Vec<VectorId>,
    data: Vec<f32>,
    positions: HashMap<VectorId, usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, pos: usize) -> &[f32] {
        let d = self.dims.unwrap_or(0);
        &self.data[pos * d..(pos + 1) * d]
    }
}

/// Descending score, ascending id.
pub(crate) fn rank_order(a: &(VectorId, f32), b: &(VectorId, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

impl VectorIndex for FlatIndex {
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn contains(&self, id: VectorId) -> bool {
        self.positions.contains_key(&id)
    }

    fn add(&mut self, id: VectorId, vector: Vec<f32>) -> Result<(), IndexError> {
        if self.positions.contains_key(&id) {
            return Err(IndexError::DuplicateVector(id));
        }
        match self.dims {
            Some(expected) if expected != vector.len() => {
                return Err(IndexError::DimensionMismatch {
                    id,
                    expected,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
            None => self.dims = Some(vector.len()),
        }
        self.positions.insert(id, self.ids.len());
        self.ids.push(id);
        self.data.extend_from_slice(&vector);
        Ok(())
    }

    fn search(&self, query: &[f32], limit: usize) -> Vec<(VectorId, f32)> {
        if limit == 0 || self.dims != Some(query.len()) {
            return Vec::new();
        }
        let mut scored: Vec<(VectorId, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, dot(query, self.row(pos))))
            .collect();
        scored.sort_by(rank_order);
        scored.truncate(limit);
        scored
    }

    fn entries(&self) -> Vec<(VectorId, &[f32])> {
        self.ids
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, self.row(pos)))
            .collect()
    }

    fn rebuild(&mut self, entries: Vec<(VectorId, Vec<f32>)>) -> Result<(), IndexError> {
        let mut fresh = FlatIndex {
            dims: self.dims,
            ..FlatIndex::default()
        };
        for (id, vector) in entries {
            fresh.add(id, vector)?;
        }
        *self = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_ranks_by_inner_product() {
        let mut index = FlatIndex::new();
        index.add(1, vec![1.0, 0.0]).unwrap();
        index.add(2, vec![0.0, 1.0]).unwrap();
        index.add(3, vec![0.6, 0.8]).unwrap();

        let hits = index.search(&[0.0, 1.0], 2);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn flat_index_ties_break_by_id() {
        let mut index = FlatIndex::new();
        index.add(9, vec![1.0, 0.0]).unwrap();
        index.add(4, vec![1.0, 0.0]).unwrap();
        let hits = index.search(&[1.0, 0.0], 10);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![4, 9]);
    }

    #[test]
    fn flat_index_rejects_duplicates_and_mismatched_dims() {
        let mut index = FlatIndex::new();
        index.add(1, vec![1.0, 0.0]).unwrap();
        assert_eq!(
            index.add(1, vec![0.0, 1.0]),
            Err(IndexError::DuplicateVector(1))
        );
        assert!(matches!(
            index.add(2, vec![1.0]),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn rebuild_replaces_contents() {
        let mut index = FlatIndex::new();
        index.add(1, vec![1.0, 0.0]).unwrap();
        index.add(2, vec![0.0, 1.0]).unwrap();
        index.rebuild(vec![(2, vec![0.0, 1.0])]).unwrap();
        assert_eq!(index.len(), 1);
        assert!(!index.contains(1));
        assert_eq!(index.dims(), Some(2));
    }
}
