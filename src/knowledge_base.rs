//! A knowledge base: one source directory bound to one document store, one
//! vector index, and one embedding model.
//!
//! # Refresh
//!
//! ```text
//! Scanning → Diffing → ProcessingChanges → Committing → Done
//!     └──────────┴──────────────┴──────────────┴──────→ Failed
//! ```
//!
//! Only `Committing` mutates anything. Everything before it is read-only
//! and can be cancelled or timed out; `Committing` always runs to the end.
//!
//! Diffing also reconciles the store against the index. Documents whose
//! chunks point at vectors the index no longer holds are dropped and
//! reprocessed as new; live vectors no chunk points at are retired. Both
//! repairs are folded into the same commit as the refresh's own changes.
//!
//! # Locking
//!
//! `refresh_lock` serializes refreshes. The index sits behind an async
//! `RwLock`: searches share the read side, and only the commit takes the
//! write side, so searches keep running while a refresh scans and embeds.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use knowledge_sync_core::chunk::chunk_text;
use knowledge_sync_core::diff::{content_hash, diff_documents};
use knowledge_sync_core::embedding::{normalize, EmbeddingProvider};
use knowledge_sync_core::index::IndexBatch;
use knowledge_sync_core::models::{ChunkRecord, DocumentRecord, SearchHit, VectorId};
use knowledge_sync_core::store::{Changeset, DocumentStore, DocumentUpsert};

use crate::config::KbConfig;
use crate::error::{FileError, FileErrorKind, KbError, KbResult};
use crate::extract::Extractors;
use crate::index_file::PersistentIndex;
use crate::scan::{ScanOutcome, ScannedFile, Scanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Idle,
    Scanning,
    Diffing,
    ProcessingChanges,
    Committing,
    Done,
    Failed,
}

/// Outcome of one successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub documents_added: usize,
    pub documents_updated: usize,
    pub documents_removed: usize,
    pub documents_unchanged: usize,
    /// Documents dropped because their vectors were missing from the index.
    pub reconciled_documents: usize,
    /// Live vectors retired because no chunk referenced them.
    pub orphan_vectors_retired: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub errors: Vec<FileError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KbStatus {
    pub phase: RefreshPhase,
    pub last_error: Option<String>,
    pub last_summary: Option<RefreshSummary>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub key: String,
    pub root: PathBuf,
    pub embedding_model: String,
    pub documents: u64,
    pub chunks: u64,
    pub live_vectors: usize,
    pub tombstones: usize,
    /// Documents whose chunks point at vectors missing from the index.
    pub dangling_documents: usize,
    /// Live vectors no chunk points at.
    pub orphan_vectors: usize,
}

/// Everything a [`KnowledgeBase`] is assembled from.
pub struct KnowledgeBaseParts {
    pub key: String,
    pub root: PathBuf,
    pub embedding_model: String,
    pub config: KbConfig,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub store: Arc<dyn DocumentStore>,
    pub index: PersistentIndex,
    pub extractors: Arc<Extractors>,
}

pub struct KnowledgeBase {
    key: String,
    root: PathBuf,
    embedding_model: String,
    config: KbConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn DocumentStore>,
    extractors: Arc<Extractors>,
    refresh_lock: Mutex<()>,
    index: RwLock<PersistentIndex>,
    next_vector_id: AtomicU64,
    status: std::sync::Mutex<KbStatus>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("key", &self.key)
            .field("root", &self.root)
            .field("embedding_model", &self.embedding_model)
            .finish_non_exhaustive()
    }
}

/// Repairs found while diffing, applied at commit.
#[derive(Debug, Default)]
struct ReconcilePlan {
    dangling_documents: BTreeSet<String>,
    index_removals: Vec<VectorId>,
    orphans: usize,
}

struct PendingDocument {
    path: String,
    content_hash: String,
    mtime: i64,
    chunks: Vec<ChunkRecord>,
    is_update: bool,
}

struct PreparedRefresh {
    batch: IndexBatch,
    changeset: Changeset,
    summary: RefreshSummary,
}

impl KnowledgeBase {
    pub async fn new(parts: KnowledgeBaseParts) -> KbResult<Self> {
        parts.config.validate()?;

        let store_max = parts.store.max_vector_id().await.map_err(KbError::Store)?;
        let next_vector_id = store_max.max(parts.index.max_id()).map_or(1, |id| id + 1);

        Ok(Self {
            key: parts.key,
            root: parts.root,
            embedding_model: parts.embedding_model,
            config: parts.config,
            embedder: parts.embedder,
            store: parts.store,
            extractors: parts.extractors,
            refresh_lock: Mutex::new(()),
            index: RwLock::new(parts.index),
            next_vector_id: AtomicU64::new(next_vector_id),
            status: std::sync::Mutex::new(KbStatus {
                phase: RefreshPhase::Idle,
                last_error: None,
                last_summary: None,
                last_refreshed_at: None,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    pub fn status(&self) -> KbStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Counts for the last committed state, including any disagreement
    /// between the store and the index that the next refresh would repair.
    pub async fn stats(&self) -> KbResult<KbStats> {
        // The commit writes the store under the index write lock, so both
        // are read from the same committed state here.
        let index = self.index.read().await;
        let store = self.store.stats().await.map_err(KbError::Store)?;
        let refs = self.store.vector_refs().await.map_err(KbError::Store)?;
        let live: HashSet<VectorId> = index.live_ids().into_iter().collect();
        let plan = reconcile(&group_by_path(refs), &live);
        Ok(KbStats {
            key: self.key.clone(),
            root: self.root.clone(),
            embedding_model: self.embedding_model.clone(),
            documents: store.documents,
            chunks: store.chunks,
            live_vectors: index.live_len(),
            tombstones: index.tombstone_count(),
            dangling_documents: plan.dangling_documents.len(),
            orphan_vectors: plan.orphans,
        })
    }

    pub async fn refresh(&self) -> KbResult<RefreshSummary> {
        self.refresh_with_cancel(CancellationToken::new()).await
    }

    /// Bring the store and index in line with the source directory.
    ///
    /// Cancelling `cancel`, or exceeding the configured refresh timeout,
    /// aborts the refresh before it commits and leaves both the store and
    /// the index exactly as they were.
    pub async fn refresh_with_cancel(&self, cancel: CancellationToken) -> KbResult<RefreshSummary> {
        let _guard = self.refresh_lock.lock().await;
        tracing::info!(key = %self.key, "refresh started");

        let result = self.run_refresh(cancel).await;

        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &result {
            Ok(summary) => {
                tracing::info!(
                    key = %self.key,
                    added = summary.documents_added,
                    updated = summary.documents_updated,
                    removed = summary.documents_removed,
                    unchanged = summary.documents_unchanged,
                    errors = summary.errors.len(),
                    "refresh done"
                );
                status.phase = RefreshPhase::Done;
                status.last_error = None;
                status.last_summary = Some(summary.clone());
                status.last_refreshed_at = Some(Utc::now());
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "refresh failed");
                status.phase = RefreshPhase::Failed;
                status.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn run_refresh(&self, cancel: CancellationToken) -> KbResult<RefreshSummary> {
        let token = cancel.child_token();
        let prepared = match self.config.refresh_timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), self.prepare(&token)).await {
                    Ok(prepared) => prepared?,
                    Err(_) => {
                        // Stop any scan still running on a blocking thread.
                        token.cancel();
                        return Err(KbError::TimedOut(secs));
                    }
                }
            }
            None => self.prepare(&token).await?,
        };
        self.commit(prepared).await
    }

    fn set_phase(&self, phase: RefreshPhase) {
        tracing::debug!(key = %self.key, ?phase, "refresh phase");
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .phase = phase;
    }

    fn allocate_vector_id(&self) -> VectorId {
        self.next_vector_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Scanning through ProcessingChanges. Read-only.
    async fn prepare(&self, cancel: &CancellationToken) -> KbResult<PreparedRefresh> {
        self.set_phase(RefreshPhase::Scanning);
        let scan = self.scan(cancel).await?;

        self.set_phase(RefreshPhase::Diffing);
        let previous = self.store.snapshot_hashes().await.map_err(KbError::Store)?;
        let refs = self.store.vector_refs().await.map_err(KbError::Store)?;
        let (live, index_dims) = {
            let index = self.index.read().await;
            let live: HashSet<VectorId> = index.live_ids().into_iter().collect();
            (live, index.dims())
        };

        let vectors_by_path = group_by_path(refs);
        let plan = reconcile(&vectors_by_path, &live);
        if !plan.dangling_documents.is_empty() || plan.orphans > 0 {
            tracing::warn!(
                key = %self.key,
                dangling = plan.dangling_documents.len(),
                orphans = plan.orphans,
                "store and index disagree, reconciling"
            );
        }

        let mut previous = previous;
        previous.retain(|path, _| !plan.dangling_documents.contains(path));

        let mut current: BTreeMap<String, String> = scan
            .files
            .iter()
            .map(|(path, file)| (path.clone(), file.content_hash.clone()))
            .collect();
        for (path, hash) in &previous {
            if !current.contains_key(path) && scan.is_obscured(path) {
                current.insert(path.clone(), hash.clone());
            }
        }
        let diff = diff_documents(&current, &previous);

        self.set_phase(RefreshPhase::ProcessingChanges);
        let mut summary = RefreshSummary {
            documents_unchanged: diff.unchanged.len(),
            reconciled_documents: plan.dangling_documents.len(),
            orphan_vectors_retired: plan.orphans,
            errors: scan.errors.clone(),
            ..RefreshSummary::default()
        };

        let changed: HashSet<&String> = diff.changed.iter().collect();
        let mut pending = Vec::new();
        for path in diff.pending() {
            if cancel.is_cancelled() {
                return Err(KbError::Cancelled);
            }
            let Some(file) = scan.files.get(path) else {
                continue;
            };
            match self.load_document(file, changed.contains(&path)).await {
                Ok(doc) => pending.push(doc),
                Err(err) => {
                    tracing::warn!(path = %err.path, kind = ?err.error_kind, "skipping file");
                    summary.errors.push(err);
                }
            }
        }

        let (mut vectors, failed) = self
            .embed_documents(&pending, index_dims, cancel, &mut summary)
            .await?;

        let mut batch = IndexBatch {
            removals: plan.index_removals,
            additions: Vec::new(),
        };
        let mut changeset = Changeset {
            removals: plan.dangling_documents.into_iter().collect(),
            upserts: Vec::new(),
        };

        for path in &diff.deleted {
            let ids = vectors_by_path.get(path).cloned().unwrap_or_default();
            summary.chunks_removed += ids.len();
            summary.documents_removed += 1;
            batch.removals.extend(ids);
            changeset.removals.push(path.clone());
        }

        for (i, doc) in pending.into_iter().enumerate() {
            if failed.contains(&i) {
                continue;
            }
            if doc.is_update {
                let ids = vectors_by_path.get(&doc.path).cloned().unwrap_or_default();
                summary.chunks_removed += ids.len();
                summary.documents_updated += 1;
                batch.removals.extend(ids);
            } else {
                summary.documents_added += 1;
            }
            for chunk in &doc.chunks {
                let vector = vectors.remove(&chunk.vector_id).ok_or_else(|| {
                    KbError::Failed(format!("no embedding for chunk {} of {}", chunk.chunk_index, doc.path))
                })?;
                batch.additions.push((chunk.vector_id, vector));
            }
            summary.chunks_added += doc.chunks.len();
            changeset.upserts.push(DocumentUpsert {
                document: DocumentRecord::new(&doc.path, &doc.content_hash, doc.mtime, &doc.chunks),
                chunks: doc.chunks,
            });
        }

        Ok(PreparedRefresh {
            batch,
            changeset,
            summary,
        })
    }

    async fn scan(&self, cancel: &CancellationToken) -> KbResult<ScanOutcome> {
        let scanner = Scanner::new(&self.root, &self.config, &self.extractors.extensions())?;
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&token))
            .await
            .map_err(|e| KbError::Failed(format!("scan task failed: {}", e)))?
    }

    /// Re-read, re-hash, extract, and chunk one file.
    async fn load_document(
        &self,
        file: &ScannedFile,
        is_update: bool,
    ) -> Result<PendingDocument, FileError> {
        let bytes = tokio::fs::read(&file.abs_path)
            .await
            .map_err(|e| FileError::new(&file.path, FileErrorKind::Unreadable, e.to_string()))?;
        // The file may have changed since the scan; what we store must
        // describe the bytes we actually chunked.
        let hash = content_hash(&bytes);

        let extractors = self.extractors.clone();
        let abs_path = file.abs_path.clone();
        let text = tokio::task::spawn_blocking(move || extractors.extract(&abs_path, &bytes))
            .await
            .map_err(|e| {
                FileError::new(&file.path, FileErrorKind::Extraction, format!("extractor crashed: {}", e))
            })?
            .map_err(|e| FileError::new(&file.path, e.kind(), e.to_string()))?;

        let chunks = chunk_text(&text, self.config.chunk_size, self.config.chunk_overlap)
            .iter()
            .map(|tc| ChunkRecord::from_text_chunk(&file.path, tc, self.allocate_vector_id()))
            .collect();

        Ok(PendingDocument {
            path: file.path.clone(),
            content_hash: hash,
            mtime: file.mtime,
            chunks,
            is_update,
        })
    }

    /// Embed every pending chunk in batches of at most `batch_size`.
    ///
    /// A batch that fails excludes every document with a chunk in it;
    /// later batches skip that document's remaining chunks. Returns the
    /// vectors by id and the indices of failed documents.
    async fn embed_documents(
        &self,
        pending: &[PendingDocument],
        index_dims: Option<usize>,
        cancel: &CancellationToken,
        summary: &mut RefreshSummary,
    ) -> KbResult<(HashMap<VectorId, Vec<f32>>, HashSet<usize>)> {
        let work: Vec<(usize, usize)> = pending
            .iter()
            .enumerate()
            .flat_map(|(d, doc)| (0..doc.chunks.len()).map(move |c| (d, c)))
            .collect();

        let mut vectors = HashMap::with_capacity(work.len());
        let mut failed = HashSet::new();
        let provider_dims = Some(self.embedder.dims()).filter(|&d| d > 0);
        let mut expected_dims = index_dims.or(provider_dims);
        let mut cursor = 0;

        while cursor < work.len() {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            while cursor < work.len() && batch.len() < self.config.batch_size {
                let item = work[cursor];
                cursor += 1;
                if !failed.contains(&item.0) {
                    batch.push(item);
                }
            }
            if batch.is_empty() {
                break;
            }

            let texts: Vec<String> = batch
                .iter()
                .map(|&(d, c)| pending[d].chunks[c].text.clone())
                .collect();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(KbError::Cancelled),
                result = self.embedder.embed(&texts) => result,
            };

            let checked = result
                .map_err(|e| format!("{:#}", e))
                .and_then(|embedded| check_batch(embedded, texts.len(), expected_dims));
            match checked {
                Ok(embedded) => {
                    if expected_dims.is_none() {
                        expected_dims = embedded.first().map(Vec::len);
                    }
                    for (&(d, c), vector) in batch.iter().zip(embedded) {
                        vectors.insert(pending[d].chunks[c].vector_id, vector);
                    }
                }
                Err(message) => {
                    tracing::warn!(key = %self.key, texts = texts.len(), error = %message, "embedding batch failed");
                    for &(d, _) in &batch {
                        if failed.insert(d) {
                            summary.errors.push(FileError::new(
                                &pending[d].path,
                                FileErrorKind::Embedding,
                                message.clone(),
                            ));
                        }
                    }
                }
            }
        }

        Ok((vectors, failed))
    }

    /// Apply the prepared refresh: index first, then the store.
    async fn commit(&self, prepared: PreparedRefresh) -> KbResult<RefreshSummary> {
        if prepared.batch.is_empty() && prepared.changeset.is_empty() {
            return Ok(prepared.summary);
        }

        self.set_phase(RefreshPhase::Committing);
        let mut index = self.index.write().await;
        index.commit(prepared.batch).await?;

        // A failure here leaves the index ahead of the store; the next
        // refresh reconciles the difference.
        self.store
            .apply(&prepared.changeset)
            .await
            .map_err(KbError::Store)?;

        Ok(prepared.summary)
    }

    /// Ranked chunks most similar to `query`.
    ///
    /// `top_k` falls back to the knowledge base's configured default.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> KbResult<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let top_k = top_k.unwrap_or(self.config.top_k);

        let embedded = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| KbError::Embedding(format!("{:#}", e)))?;
        let query_vector = embedded
            .into_iter()
            .next()
            .ok_or_else(|| KbError::Embedding("provider returned no vector for the query".into()))?;

        let index = self.index.read().await;
        let ranked = index.search(&query_vector, top_k)?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<VectorId> = ranked.iter().map(|(id, _)| *id).collect();
        let mut chunks: HashMap<VectorId, ChunkRecord> = self
            .store
            .chunks_for_vectors(&ids)
            .await
            .map_err(KbError::Store)?
            .into_iter()
            .map(|c| (c.vector_id, c))
            .collect();
        drop(index);

        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| chunks.remove(&id).map(|c| SearchHit::from_chunk(c, score)))
            .collect())
    }
}

fn group_by_path(refs: Vec<(String, VectorId)>) -> HashMap<String, Vec<VectorId>> {
    let mut vectors_by_path: HashMap<String, Vec<VectorId>> = HashMap::new();
    for (path, id) in refs {
        vectors_by_path.entry(path).or_default().push(id);
    }
    vectors_by_path
}

/// Find documents with dangling vector references and live vectors that no
/// chunk references.
fn reconcile(
    vectors_by_path: &HashMap<String, Vec<VectorId>>,
    live: &HashSet<VectorId>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut referenced = HashSet::new();

    for (path, ids) in vectors_by_path {
        referenced.extend(ids.iter().copied());
        if ids.iter().any(|id| !live.contains(id)) {
            plan.dangling_documents.insert(path.clone());
            plan.index_removals
                .extend(ids.iter().copied().filter(|id| live.contains(id)));
        }
    }

    let mut orphans: Vec<VectorId> = live
        .iter()
        .copied()
        .filter(|id| !referenced.contains(id))
        .collect();
    orphans.sort_unstable();
    plan.orphans = orphans.len();
    plan.index_removals.extend(orphans);
    plan
}

/// Validate one provider response against the batch it answers.
fn check_batch(
    embedded: Vec<Vec<f32>>,
    expected_len: usize,
    expected_dims: Option<usize>,
) -> Result<Vec<Vec<f32>>, String> {
    if embedded.len() != expected_len {
        return Err(format!(
            "provider returned {} vectors for {} texts",
            embedded.len(),
            expected_len
        ));
    }
    let dims = expected_dims.or_else(|| embedded.first().map(Vec::len));
    for (i, vector) in embedded.iter().enumerate() {
        if Some(vector.len()) != dims {
            return Err(format!(
                "vector {} has {} dimensions, expected {}",
                i,
                vector.len(),
                dims.unwrap_or(0)
            ));
        }
        if normalize(vector).is_none() {
            return Err(format!("vector {} is empty, zero, or not finite", i));
        }
    }
    Ok(embedded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_flags_dangling_documents_and_orphans() {
        let mut refs = HashMap::new();
        refs.insert("ok.txt".to_string(), vec![1, 2]);
        refs.insert("broken.txt".to_string(), vec![3, 4]);
        let live: HashSet<VectorId> = [1, 2, 3, 9].into_iter().collect();

        let plan = reconcile(&refs, &live);
        assert_eq!(
            plan.dangling_documents.into_iter().collect::<Vec<_>>(),
            vec!["broken.txt".to_string()]
        );
        assert_eq!(plan.orphans, 1);
        let mut removals = plan.index_removals;
        removals.sort_unstable();
        assert_eq!(removals, vec![3, 9]);
    }

    #[test]
    fn check_batch_rejects_bad_responses() {
        assert!(check_batch(vec![vec![1.0]], 2, None).is_err());
        assert!(check_batch(vec![vec![1.0, 0.0], vec![1.0]], 2, None).is_err());
        assert!(check_batch(vec![vec![0.0, 0.0]], 1, None).is_err());
        assert!(check_batch(vec![vec![1.0, f32::NAN]], 1, Some(2)).is_err());
        assert!(check_batch(vec![vec![1.0, 0.0, 0.0]], 1, Some(2)).is_err());
        assert!(check_batch(vec![vec![0.5, 0.5]], 1, Some(2)).is_ok());
    }
}
