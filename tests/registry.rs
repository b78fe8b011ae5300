mod common;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tempfile::TempDir;

use knowledge_sync::config::{KbConfig, RequestParams, DEFAULT_CHUNK_SIZE};
use knowledge_sync::error::KbError;
use knowledge_sync::extract::{ExtractError, Extractors, TextExtractor};
use knowledge_sync::registry::{cache_key, storage_dir_name, STORE_FILE_NAME};
use knowledge_sync::index_file::INDEX_FILE_NAME;

use common::{
    ephemeral_registry, persistent_registry, test_config, TestFactory, MODEL, OTHER_MODEL,
};

fn source_with_fruit() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("fruit.txt"), "apples and bananas").unwrap();
    fs::write(dir.path().join("tools.txt"), "hammer and wrench").unwrap();
    dir
}

#[tokio::test]
async fn concurrent_first_references_share_one_instance() {
    let dir = source_with_fruit();
    let factory = TestFactory::new();
    let registry = Arc::new(ephemeral_registry(test_config(), factory.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let path = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            registry
                .get_or_create(&path, MODEL, KbConfig::default())
                .await
                .unwrap()
        }));
    }
    let mut instances = Vec::new();
    for handle in handles {
        instances.push(handle.await.unwrap());
    }

    assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(registry.keys().len(), 1);
}

#[tokio::test]
async fn models_over_one_directory_are_isolated() {
    let dir = source_with_fruit();
    let registry = ephemeral_registry(test_config(), TestFactory::new());
    let letters = RequestParams::new(dir.path());
    let reversed = RequestParams {
        embedding_model: Some(OTHER_MODEL.to_string()),
        ..RequestParams::new(dir.path())
    };

    registry.refresh(&letters).await.unwrap();
    assert_eq!(registry.search(&letters, "bananas").await.unwrap().len(), 2);
    assert!(registry.search(&reversed, "bananas").await.unwrap().is_empty());

    let keys = registry.keys();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().any(|k| k.ends_with(&format!(":{}", MODEL))));
    assert!(keys.iter().any(|k| k.ends_with(&format!(":{}", OTHER_MODEL))));
}

#[tokio::test]
async fn failed_construction_leaves_nothing_registered() {
    let dir = source_with_fruit();
    let registry = ephemeral_registry(test_config(), TestFactory::new());

    let err = registry
        .get_or_create(dir.path(), "no-such-model", KbConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::UnknownModel(_)));

    let err = registry
        .get_or_create(&dir.path().join("missing"), MODEL, KbConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::InvalidPath { .. }));

    assert!(registry.keys().is_empty());

    // The same key can still be built afterwards.
    registry
        .get_or_create(dir.path(), MODEL, KbConfig::default())
        .await
        .unwrap();
    assert_eq!(registry.keys().len(), 1);
}

#[tokio::test]
async fn existing_instance_keeps_its_configuration() {
    let dir = source_with_fruit();
    let registry = ephemeral_registry(test_config(), TestFactory::new());
    let first = KbConfig {
        chunk_size: 100,
        chunk_overlap: 10,
        ..KbConfig::default()
    };
    let second = KbConfig {
        chunk_size: 400,
        chunk_overlap: 10,
        ..KbConfig::default()
    };

    let a = registry.get_or_create(dir.path(), MODEL, first).await.unwrap();
    let b = registry.get_or_create(dir.path(), MODEL, second).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.config().chunk_size, 100);
}

#[tokio::test]
async fn close_forgets_the_instance() {
    let dir = source_with_fruit();
    let registry = ephemeral_registry(test_config(), TestFactory::new());
    let kb = registry
        .get_or_create(dir.path(), MODEL, KbConfig::default())
        .await
        .unwrap();
    let key = kb.key().to_string();

    assert!(registry.get(&key).is_some());
    assert!(registry.close(&key));
    assert!(registry.get(&key).is_none());
    assert!(!registry.close(&key));

    // Holders of the old handle keep working.
    kb.refresh().await.unwrap();

    let rebuilt = registry
        .get_or_create(dir.path(), MODEL, KbConfig::default())
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&kb, &rebuilt));
}

#[tokio::test]
async fn call_values_beat_process_values_beat_defaults() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.defaults.chunk_size = Some(300);
    let registry = ephemeral_registry(config, TestFactory::new());

    let process = registry.resolve(&RequestParams::new(dir.path()));
    assert_eq!(process.kb.chunk_size, 300);
    assert_eq!(process.embedding_model, MODEL);

    let call = registry.resolve(&RequestParams {
        chunk_size: Some(50),
        embedding_model: Some(OTHER_MODEL.to_string()),
        ..RequestParams::new(dir.path())
    });
    assert_eq!(call.kb.chunk_size, 50);
    assert_eq!(call.embedding_model, OTHER_MODEL);

    let bare = ephemeral_registry(test_config(), TestFactory::new());
    assert_eq!(
        bare.resolve(&RequestParams::new(dir.path())).kb.chunk_size,
        DEFAULT_CHUNK_SIZE
    );
}

#[tokio::test]
async fn persistent_state_survives_a_new_registry() {
    let dir = source_with_fruit();
    let storage = TempDir::new().unwrap();
    let params = RequestParams::new(dir.path());

    {
        let registry = persistent_registry(test_config(), TestFactory::new(), storage.path());
        let summary = registry.refresh(&params).await.unwrap();
        assert_eq!(summary.documents_added, 2);
    }

    let (key, _) = cache_key(dir.path(), MODEL).unwrap();
    let kb_dir = storage.path().join(storage_dir_name(&key));
    assert!(kb_dir.join(STORE_FILE_NAME).exists());
    assert!(kb_dir.join(INDEX_FILE_NAME).exists());

    let factory = TestFactory::new();
    let registry = persistent_registry(test_config(), factory.clone(), storage.path());

    let hits = registry.search(&params, "bananas").await.unwrap();
    assert_eq!(hits[0].document_path, "fruit.txt");
    let calls = factory.letters.calls();

    let summary = registry.refresh(&params).await.unwrap();
    assert_eq!(summary.documents_unchanged, 2);
    assert_eq!(summary.reconciled_documents, 0);
    assert_eq!(factory.letters.calls(), calls);

    let stats = registry.get(&key).unwrap().stats().await.unwrap();
    assert_eq!((stats.documents, stats.chunks, stats.live_vectors), (2, 2, 2));
}

#[tokio::test]
async fn persistent_keys_use_separate_directories() {
    let dir = source_with_fruit();
    let storage = TempDir::new().unwrap();
    let registry = persistent_registry(test_config(), TestFactory::new(), storage.path());

    registry.refresh(&RequestParams::new(dir.path())).await.unwrap();
    registry
        .refresh(&RequestParams {
            embedding_model: Some(OTHER_MODEL.to_string()),
            ..RequestParams::new(dir.path())
        })
        .await
        .unwrap();

    let dirs = fs::read_dir(storage.path()).unwrap().count();
    assert_eq!(dirs, 2);
}

struct ShoutExtractor;

impl TextExtractor for ShoutExtractor {
    fn extensions(&self) -> &[&str] {
        &["shout"]
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        Ok(String::from_utf8_lossy(bytes).to_uppercase())
    }
}

#[tokio::test]
async fn registered_extractors_widen_the_recognized_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("loud.shout"), "quiet words").unwrap();
    fs::write(dir.path().join("plain.txt"), "plain words").unwrap();

    let default = ephemeral_registry(test_config(), TestFactory::new());
    let summary = default.refresh(&RequestParams::new(dir.path())).await.unwrap();
    assert_eq!(summary.documents_added, 1);

    let mut extractors = Extractors::with_builtins();
    extractors.register(Arc::new(ShoutExtractor));
    let custom = ephemeral_registry(test_config(), TestFactory::new()).with_extractors(extractors);
    let params = RequestParams::new(dir.path());
    let summary = custom.refresh(&params).await.unwrap();
    assert_eq!(summary.documents_added, 2);

    let hits = custom.search(&params, "QUIET").await.unwrap();
    assert!(hits.iter().any(|h| h.chunk_text == "QUIET WORDS"));
}

#[tokio::test]
async fn persisted_chunking_is_fixed_for_its_key() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "abcd ".repeat(8)).unwrap();
    let storage = TempDir::new().unwrap();
    let small = RequestParams {
        chunk_size: Some(20),
        chunk_overlap: Some(5),
        ..RequestParams::new(dir.path())
    };

    {
        let registry = persistent_registry(test_config(), TestFactory::new(), storage.path());
        assert_eq!(registry.refresh(&small).await.unwrap().chunks_added, 2);
    }

    let registry = persistent_registry(test_config(), TestFactory::new(), storage.path());
    fs::write(dir.path().join("b.txt"), "abcd ".repeat(8)).unwrap();
    let err = registry
        .refresh(&RequestParams::new(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::InvalidConfig(_)), "{:?}", err);
    assert!(registry.keys().is_empty());

    // Reads take whatever chunking the store was written with.
    let hits = registry
        .search(&RequestParams::new(dir.path()), "abcd")
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    let (key, _) = cache_key(dir.path(), MODEL).unwrap();
    let kb = registry.get(&key).unwrap();
    assert_eq!((kb.config().chunk_size, kb.config().chunk_overlap), (20, 5));

    let summary = registry.refresh(&small).await.unwrap();
    assert_eq!(summary.documents_added, 1);
    assert_eq!(summary.documents_unchanged, 1);
    assert_eq!(summary.chunks_added, 2);
}

#[tokio::test]
async fn call_top_k_does_not_become_the_default() {
    let dir = TempDir::new().unwrap();
    for i in 0..6 {
        fs::write(dir.path().join(format!("{}.txt", i)), format!("note number {}", i)).unwrap();
    }
    let mut config = test_config();
    config.defaults.top_k = Some(5);
    let registry = ephemeral_registry(config, TestFactory::new());

    let first = RequestParams {
        top_k: Some(1),
        ..RequestParams::new(dir.path())
    };
    registry.refresh(&first).await.unwrap();
    assert_eq!(registry.search(&first, "note").await.unwrap().len(), 1);

    let later = RequestParams::new(dir.path());
    assert_eq!(registry.search(&later, "note").await.unwrap().len(), 5);

    let zero = RequestParams {
        top_k: Some(0),
        ..RequestParams::new(dir.path())
    };
    assert!(matches!(
        registry.search(&zero, "note").await,
        Err(KbError::InvalidConfig(_))
    ));
}
