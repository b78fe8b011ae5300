//! On-disk persistence for a knowledge base's vector index.
//!
//! The adapter snapshot is written to `<file>.tmp` and renamed over the
//! live file, so a crash mid-write never leaves a torn index behind.

use std::ops::Deref;
use std::path::{Path, PathBuf};

use knowledge_sync_core::index::{AppliedBatch, IndexBatch, IndexError, VectorIndexAdapter};

pub const INDEX_FILE_NAME: &str = "vectors.idx";

/// A [`VectorIndexAdapter`] optionally backed by a snapshot file.
pub struct PersistentIndex {
    adapter: VectorIndexAdapter,
    path: Option<PathBuf>,
}

impl PersistentIndex {
    pub fn in_memory(rebuild_ratio: f32) -> Self {
        Self {
            adapter: VectorIndexAdapter::new(rebuild_ratio),
            path: None,
        }
    }

    /// Load the snapshot at `path`, or start empty if there is none.
    pub async fn open(path: &Path, rebuild_ratio: f32) -> Result<Self, IndexError> {
        let adapter = match tokio::fs::read(path).await {
            Ok(bytes) => VectorIndexAdapter::from_bytes(&bytes, rebuild_ratio)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                VectorIndexAdapter::new(rebuild_ratio)
            }
            Err(e) => {
                return Err(IndexError::Persist(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        tracing::debug!(
            path = %path.display(),
            live = adapter.live_len(),
            tombstones = adapter.tombstone_count(),
            "opened vector index"
        );
        Ok(Self {
            adapter,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn persist(&self) -> Result<(), IndexError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("idx.tmp");
        let bytes = self.adapter.to_bytes();
        let io = |e: std::io::Error| IndexError::Persist(format!("{}: {}", path.display(), e));
        tokio::fs::write(&tmp, &bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, path).await.map_err(io)?;
        Ok(())
    }

    /// Apply a batch and make it durable.
    ///
    /// On rejection or persist failure the in-memory index is restored and
    /// the file is untouched. Compaction runs only after the batch is
    /// durable; failing to persist the compacted form is logged, since the
    /// previous file already describes the same live set.
    pub async fn commit(&mut self, batch: IndexBatch) -> Result<AppliedBatch, IndexError> {
        let applied = self.adapter.apply(batch)?;

        if let Err(e) = self.persist().await {
            self.adapter.revert(applied)?;
            return Err(e);
        }

        if self.adapter.maybe_compact()? {
            tracing::info!(live = self.adapter.live_len(), "compacted vector index");
            if let Err(e) = self.persist().await {
                tracing::warn!(error = %e, "failed to persist compacted index");
            }
        }

        Ok(applied)
    }
}

impl Deref for PersistentIndex {
    type Target = VectorIndexAdapter;

    fn deref(&self) -> &Self::Target {
        &self.adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(additions: &[(u64, [f32; 2])], removals: &[u64]) -> IndexBatch {
        IndexBatch {
            removals: removals.to_vec(),
            additions: additions.iter().map(|(id, v)| (*id, v.to_vec())).collect(),
        }
    }

    #[tokio::test]
    async fn commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE_NAME);

        let mut index = PersistentIndex::open(&path, 0.9).await.unwrap();
        index
            .commit(batch(&[(1, [1.0, 0.0]), (2, [0.0, 1.0])], &[]))
            .await
            .unwrap();
        index.commit(batch(&[], &[1])).await.unwrap();

        let reopened = PersistentIndex::open(&path, 0.9).await.unwrap();
        assert_eq!(reopened.live_ids(), vec![2]);
        assert_eq!(reopened.max_id(), Some(2));
    }

    #[tokio::test]
    async fn persist_failure_restores_memory_state() {
        let dir = TempDir::new().unwrap();
        // Parent directory does not exist, so every write fails.
        let path = dir.path().join("missing").join(INDEX_FILE_NAME);
        let mut index = PersistentIndex::open(&path, 0.3).await.unwrap();

        let err = index.commit(batch(&[(1, [1.0, 0.0])], &[])).await.unwrap_err();
        assert!(matches!(err, IndexError::Persist(_)));
        assert_eq!(index.live_len(), 0);
        assert!(!index.is_live(1));
    }

    #[tokio::test]
    async fn in_memory_index_never_touches_disk() {
        let mut index = PersistentIndex::in_memory(0.3);
        index.commit(batch(&[(5, [0.3, 0.4])], &[])).await.unwrap();
        assert!(index.path().is_none());
        assert_eq!(index.live_ids(), vec![5]);
    }
}
