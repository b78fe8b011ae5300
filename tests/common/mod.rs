#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use knowledge_sync::config::{Config, KbConfig};
use knowledge_sync::embedding::EmbedderFactory;
use knowledge_sync::error::{KbError, KbResult};
use knowledge_sync::extract::Extractors;
use knowledge_sync::index_file::PersistentIndex;
use knowledge_sync::knowledge_base::{KnowledgeBase, KnowledgeBaseParts};
use knowledge_sync::registry::{KnowledgeBaseRegistry, StorageMode};
use knowledge_sync_core::embedding::EmbeddingProvider;
use knowledge_sync_core::models::{ChunkRecord, DocumentRecord, VectorId};
use knowledge_sync_core::store::memory::InMemoryStore;
use knowledge_sync_core::store::{Changeset, DocumentStore, StoreStats};

pub const MODEL: &str = "letters";
pub const OTHER_MODEL: &str = "letters-reversed";

/// Deterministic embedder: letter frequencies plus a constant component.
///
/// Texts containing `fail_marker` make their whole batch fail. With `hold`
/// set, `embed` signals `started` and then stalls.
#[derive(Default)]
pub struct LetterEmbedder {
    pub reversed: bool,
    pub fail_marker: Mutex<Option<String>>,
    pub hold: AtomicBool,
    pub started: Notify,
    pub calls: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl LetterEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reversed() -> Arc<Self> {
        Arc::new(Self {
            reversed: true,
            ..Self::default()
        })
    }

    pub fn fail_on(&self, marker: Option<&str>) {
        *self.fail_marker.lock().unwrap() = marker.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 27];
        v[26] = 0.1;
        for b in text.bytes().filter(u8::is_ascii_alphabetic) {
            let slot = (b.to_ascii_lowercase() - b'a') as usize;
            let slot = if self.reversed { 25 - slot } else { slot };
            v[slot] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for LetterEmbedder {
    fn model_name(&self) -> &str {
        if self.reversed {
            OTHER_MODEL
        } else {
            MODEL
        }
    }

    fn dims(&self) -> usize {
        27
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        if self.hold.load(Ordering::SeqCst) {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        let marker = self.fail_marker.lock().unwrap().clone();
        if let Some(marker) = marker {
            if texts.iter().any(|t| t.contains(&marker)) {
                bail!("provider rejected batch");
            }
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Serves `MODEL` and `OTHER_MODEL`; everything else is unknown.
pub struct TestFactory {
    pub letters: Arc<LetterEmbedder>,
    pub reversed: Arc<LetterEmbedder>,
    pub created: AtomicUsize,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            letters: LetterEmbedder::new(),
            reversed: LetterEmbedder::reversed(),
            created: AtomicUsize::new(0),
        })
    }
}

impl EmbedderFactory for TestFactory {
    fn create(&self, model: &str) -> KbResult<Arc<dyn EmbeddingProvider>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        match model {
            MODEL => Ok(self.letters.clone()),
            OTHER_MODEL => Ok(self.reversed.clone()),
            other => Err(KbError::UnknownModel(other.to_string())),
        }
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.defaults.embedding_model = Some(MODEL.to_string());
    config
}

pub fn ephemeral_registry(config: Config, factory: Arc<TestFactory>) -> KnowledgeBaseRegistry {
    KnowledgeBaseRegistry::new(config, factory).with_storage(StorageMode::Ephemeral)
}

pub fn persistent_registry(
    config: Config,
    factory: Arc<TestFactory>,
    storage_root: &Path,
) -> KnowledgeBaseRegistry {
    KnowledgeBaseRegistry::new(config, factory).with_storage(StorageMode::Persistent {
        root: storage_root.to_path_buf(),
    })
}

/// An in-memory knowledge base over `store`, bypassing the registry.
pub async fn knowledge_base(
    root: &Path,
    config: KbConfig,
    embedder: Arc<LetterEmbedder>,
    store: Arc<dyn DocumentStore>,
) -> KnowledgeBase {
    KnowledgeBase::new(KnowledgeBaseParts {
        key: format!("{}:{}", root.display(), MODEL),
        root: root.to_path_buf(),
        embedding_model: MODEL.to_string(),
        index: PersistentIndex::in_memory(config.rebuild_ratio),
        config,
        embedder,
        store,
        extractors: Arc::new(Extractors::with_builtins()),
    })
    .await
    .unwrap()
}

/// In-memory store whose `apply` can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    pub fail_apply: AtomicBool,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn upsert(&self, document: &DocumentRecord, chunks: &[ChunkRecord]) -> Result<()> {
        self.inner.upsert(document, chunks).await
    }

    async fn remove(&self, path: &str) -> Result<Vec<VectorId>> {
        self.inner.remove(path).await
    }

    async fn apply(&self, changeset: &Changeset) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.apply(changeset).await
    }

    async fn snapshot_hashes(&self) -> Result<BTreeMap<String, String>> {
        self.inner.snapshot_hashes().await
    }

    async fn vector_refs(&self) -> Result<Vec<(String, VectorId)>> {
        self.inner.vector_refs().await
    }

    async fn chunks_for_vectors(&self, ids: &[VectorId]) -> Result<Vec<ChunkRecord>> {
        self.inner.chunks_for_vectors(ids).await
    }

    async fn max_vector_id(&self) -> Result<Option<VectorId>> {
        self.inner.max_vector_id().await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

/// Every store chunk points at a live vector and every live vector is
/// pointed at by exactly one chunk.
pub async fn assert_consistent(kb: &KnowledgeBase) {
    let stats = kb.stats().await.unwrap();
    assert_eq!(
        (stats.dangling_documents, stats.orphan_vectors),
        (0, 0),
        "store and index disagree: {:?}",
        stats
    );
    assert_eq!(
        stats.chunks as usize, stats.live_vectors,
        "store chunks and live vectors diverged: {:?}",
        stats
    );
}

/// Sorted vector ids of each document's chunks.
pub async fn vector_ids_by_path(store: &dyn DocumentStore) -> BTreeMap<String, Vec<VectorId>> {
    let mut by_path: BTreeMap<String, Vec<VectorId>> = BTreeMap::new();
    for (path, id) in store.vector_refs().await.unwrap() {
        by_path.entry(path).or_default().push(id);
    }
    for ids in by_path.values_mut() {
        ids.sort_unstable();
    }
    by_path
}
