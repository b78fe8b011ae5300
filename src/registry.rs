//! Cache of long-lived knowledge bases.
//!
//! Instances are keyed by `canonical(path) + ":" + model`. The first
//! reference to a key builds the instance; every later reference, including
//! ones racing with the build, gets the same `Arc`.
//!
//! The map lock is held only long enough to fetch or insert a per-key
//! [`OnceCell`]. Construction runs under that cell, so a slow build for one
//! key never blocks lookups for another.
//!
//! ```text
//! storage root/
//!   3f2a9c0d1e4b5a67/     # sha256(key)[..16]
//!     store.sqlite
//!     vectors.idx
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use knowledge_sync_core::models::SearchHit;
use knowledge_sync_core::store::{memory::InMemoryStore, DocumentStore};

use crate::config::{Config, KbConfig, RequestParams, ResolvedRequest};
use crate::embedding::{ConfiguredEmbedderFactory, EmbedderFactory};
use crate::error::{KbError, KbResult};
use crate::extract::Extractors;
use crate::index_file::{PersistentIndex, INDEX_FILE_NAME};
use crate::knowledge_base::{KbStats, KnowledgeBase, KnowledgeBaseParts, RefreshSummary};
use crate::sqlite_store::SqliteStore;

pub const STORE_FILE_NAME: &str = "store.sqlite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    /// One directory per key under `root`; survives restarts.
    Persistent { root: PathBuf },
    /// In-memory store and index.
    Ephemeral,
}

type Slot = Arc<OnceCell<Arc<KnowledgeBase>>>;

/// What the caller intends to do with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Refreshing, or explicitly opening with a configuration. Chunking
    /// parameters must match what persisted storage was written with.
    Write,
    /// Search and stats carry no chunking intent; persisted chunking
    /// parameters are adopted as they are.
    Read,
}

pub struct KnowledgeBaseRegistry {
    config: Config,
    storage: StorageMode,
    embedders: Arc<dyn EmbedderFactory>,
    extractors: Arc<Extractors>,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Canonical cache key and source root for `path` and `model`.
pub fn cache_key(path: &Path, model: &str) -> KbResult<(String, PathBuf)> {
    let canonical = std::fs::canonicalize(path).map_err(|e| KbError::InvalidPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !canonical.is_dir() {
        return Err(KbError::InvalidPath {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    Ok((format!("{}:{}", canonical.display(), model), canonical))
}

/// Directory name for a key under the persistent storage root.
pub fn storage_dir_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

impl KnowledgeBaseRegistry {
    /// Registry whose providers and storage come from `config`.
    pub fn from_config(config: Config) -> Self {
        let embedders = Arc::new(ConfiguredEmbedderFactory::new(config.embedding.clone()));
        Self::new(config, embedders)
    }

    pub fn new(config: Config, embedders: Arc<dyn EmbedderFactory>) -> Self {
        let storage = if config.storage.ephemeral {
            StorageMode::Ephemeral
        } else {
            StorageMode::Persistent {
                root: config.storage.root.clone(),
            }
        };
        Self {
            config,
            storage,
            embedders,
            extractors: Arc::new(Extractors::with_builtins()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_extractors(mut self, extractors: Extractors) -> Self {
        self.extractors = Arc::new(extractors);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the instance for `(path, model)`, building it on first use.
    ///
    /// If the instance already exists, its own configuration stays in
    /// force; a differing `config` is logged and ignored. Persisted storage
    /// written with other chunking parameters is refused with
    /// [`KbError::InvalidConfig`].
    pub async fn get_or_create(
        &self,
        path: &Path,
        model: &str,
        config: KbConfig,
    ) -> KbResult<Arc<KnowledgeBase>> {
        self.instance(path, model, config, Access::Write).await
    }

    async fn instance(
        &self,
        path: &Path,
        model: &str,
        config: KbConfig,
        access: Access,
    ) -> KbResult<Arc<KnowledgeBase>> {
        let (key, root) = cache_key(path, model)?;

        let slot = self
            .lock_slots()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = slot
            .get_or_try_init(|| self.build(key.clone(), root, model, config.clone(), access))
            .await
            .cloned();

        match result {
            Ok(kb) => {
                if access == Access::Write && kb.config() != &config {
                    tracing::warn!(
                        key = %key,
                        "knowledge base already exists with a different configuration; keeping the existing one"
                    );
                }
                Ok(kb)
            }
            Err(e) => {
                let mut slots = self.lock_slots();
                // Drop the empty slot unless someone else is about to retry it.
                if let Some(current) = slots.get(&key) {
                    if Arc::ptr_eq(current, &slot)
                        && !slot.initialized()
                        && Arc::strong_count(&slot) == 2
                    {
                        slots.remove(&key);
                    }
                }
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        key: String,
        root: PathBuf,
        model: &str,
        mut config: KbConfig,
        access: Access,
    ) -> KbResult<Arc<KnowledgeBase>> {
        config.validate()?;
        let embedder = self.embedders.create(model)?;

        let (store, index) = match &self.storage {
            StorageMode::Persistent { root: storage_root } => {
                let dir = storage_root.join(storage_dir_name(&key));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to create {}", dir.display()))
                    .map_err(KbError::Store)?;
                let store = SqliteStore::open(&dir.join(STORE_FILE_NAME))
                    .await
                    .map_err(KbError::Store)?;
                store
                    .ensure_meta("cache_key", &key)
                    .await
                    .map_err(KbError::Store)?;
                store
                    .ensure_meta("embedding_model", model)
                    .await
                    .map_err(KbError::Store)?;
                check_chunking(&store, &mut config, access).await?;
                let index =
                    PersistentIndex::open(&dir.join(INDEX_FILE_NAME), config.rebuild_ratio).await?;
                (Arc::new(store) as Arc<dyn DocumentStore>, index)
            }
            StorageMode::Ephemeral => (
                Arc::new(InMemoryStore::new()) as Arc<dyn DocumentStore>,
                PersistentIndex::in_memory(config.rebuild_ratio),
            ),
        };

        let kb = KnowledgeBase::new(KnowledgeBaseParts {
            key: key.clone(),
            root,
            embedding_model: model.to_string(),
            config,
            embedder,
            store,
            index,
            extractors: self.extractors.clone(),
        })
        .await?;

        tracing::info!(key = %key, storage = ?self.storage, "knowledge base ready");
        Ok(Arc::new(kb))
    }

    /// The live instance for `key`, if it has been built.
    pub fn get(&self, key: &str) -> Option<Arc<KnowledgeBase>> {
        self.lock_slots()
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Forget the instance for `key`. In-flight requests holding it finish
    /// normally. Returns whether an instance was registered.
    pub fn close(&self, key: &str) -> bool {
        let removed = self.lock_slots().remove(key);
        let existed = removed.map(|slot| slot.initialized()).unwrap_or(false);
        if existed {
            tracing::info!(key = %key, "knowledge base closed");
        }
        existed
    }

    /// Keys of all built instances, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock_slots()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn resolve(&self, params: &RequestParams) -> ResolvedRequest {
        self.config.resolve_request(params)
    }

    pub async fn refresh(&self, params: &RequestParams) -> KbResult<RefreshSummary> {
        self.refresh_with_cancel(params, CancellationToken::new())
            .await
    }

    pub async fn refresh_with_cancel(
        &self,
        params: &RequestParams,
        cancel: CancellationToken,
    ) -> KbResult<RefreshSummary> {
        let resolved = self.resolve(params);
        let kb = self
            .instance(
                &resolved.source_path,
                &resolved.embedding_model,
                resolved.kb,
                Access::Write,
            )
            .await?;
        kb.refresh_with_cancel(cancel).await
    }

    /// Search the instance for `params`, building it (empty) if needed.
    ///
    /// Only `top_k` is taken per call; chunking parameters belong to the
    /// instance.
    pub async fn search(&self, params: &RequestParams, query: &str) -> KbResult<Vec<SearchHit>> {
        let resolved = self.resolve(params);
        if resolved.top_k == 0 {
            return Err(KbError::InvalidConfig("top_k must be > 0".into()));
        }
        let kb = self
            .instance(
                &resolved.source_path,
                &resolved.embedding_model,
                resolved.kb,
                Access::Read,
            )
            .await?;
        kb.search(query, Some(resolved.top_k)).await
    }

    /// Counts for the instance for `params`, building it (empty) if needed.
    pub async fn stats(&self, params: &RequestParams) -> KbResult<KbStats> {
        let resolved = self.resolve(params);
        let kb = self
            .instance(
                &resolved.source_path,
                &resolved.embedding_model,
                resolved.kb,
                Access::Read,
            )
            .await?;
        kb.stats().await
    }
}

/// Record the chunking parameters a persistent store is written with, or
/// hold `config` to the ones already recorded.
async fn check_chunking(
    store: &SqliteStore,
    config: &mut KbConfig,
    access: Access,
) -> KbResult<()> {
    let fields = [
        ("chunk_size", &mut config.chunk_size),
        ("chunk_overlap", &mut config.chunk_overlap),
    ];
    for (name, value) in fields {
        let wanted = value.to_string();
        match store.meta(name).await.map_err(KbError::Store)? {
            Some(stored) if stored == wanted => {}
            Some(stored) if access == Access::Read => {
                *value = stored.parse().map_err(|_| {
                    KbError::InvalidConfig(format!("stored {} '{}' is not a number", name, stored))
                })?;
            }
            Some(stored) => {
                return Err(KbError::InvalidConfig(format!(
                    "{} is {} for this knowledge base, got {}; use another storage root to re-chunk",
                    name, stored, wanted
                )))
            }
            None => store
                .ensure_meta(name, &wanted)
                .await
                .map_err(KbError::Store)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cache_key_canonicalizes_and_appends_model() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("docs");
        std::fs::create_dir(&nested).unwrap();

        let (a, _) = cache_key(&nested, "m1").unwrap();
        let (b, root) = cache_key(&nested.join("..").join("docs"), "m1").unwrap();
        let (c, _) = cache_key(&nested, "m2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(":m1"));
        assert_eq!(root, std::fs::canonicalize(&nested).unwrap());
    }

    #[test]
    fn cache_key_rejects_missing_and_non_directories() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(matches!(
            cache_key(&dir.path().join("absent"), "m"),
            Err(KbError::InvalidPath { .. })
        ));
        assert!(matches!(cache_key(&file, "m"), Err(KbError::InvalidPath { .. })));
    }

    #[test]
    fn storage_dir_name_is_stable_hex_prefix() {
        let name = storage_dir_name("/docs:all-minilm-l6-v2");
        assert_eq!(name.len(), 16);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, storage_dir_name("/docs:all-minilm-l6-v2"));
        assert_ne!(name, storage_dir_name("/docs:other"));
    }
}
