//! End-to-end store lifecycle: index records on two branches, persist,
//! reload through the cache, and garbage-collect after deletions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use semdex_vector_store::{
    collection_key, content_hash, index_path, load_collection, ContentRecord, HnswConfig,
    HnswIndex, HnswIndexCache, VectorStore, VisibilityOutcome, VisibilityRecord,
};

const DIMS: usize = 8;

fn vector_for(seed: usize) -> Vec<f32> {
    // Distinct, deterministic directions: a one-hot axis with a small
    // seed-dependent tilt.
    let mut v = vec![0.05; DIMS];
    v[seed % DIMS] = 1.0;
    v[(seed + 3) % DIMS] = 0.2 + (seed as f32) * 0.01;
    v
}

fn record(text: &str, path: &str, chunk: usize, seed: usize) -> ContentRecord {
    ContentRecord {
        content_hash: content_hash(text),
        vector: vector_for(seed),
        file_path: path.to_string(),
        chunk_index: chunk,
        start_line: chunk * 40 + 1,
        end_line: chunk * 40 + 40,
        provider_name: "stub".to_string(),
        model_name: "stub-model".to_string(),
        created_at_ms: 1_700_000_000_000,
    }
}

fn seen(branch: &str, path: &str, chunk: usize, text: &str, commit: &str) -> VisibilityRecord {
    VisibilityRecord {
        branch: branch.to_string(),
        file_path: path.to_string(),
        chunk_index: chunk,
        content_hash: content_hash(text),
        commit: commit.to_string(),
        updated_at_ms: 1_700_000_000_000,
    }
}

async fn populate_two_branches(root: &Path, key: &str) -> VectorStore {
    let mut store = VectorStore::open(root, key).await.unwrap();

    // main has two files; dev shares lib.rs and adds its own file.
    store.insert_content(record("fn alpha() {}", "src/lib.rs", 0, 0)).unwrap();
    store.insert_content(record("fn beta() {}", "src/main.rs", 0, 1)).unwrap();
    store.insert_content(record("fn gamma() {}", "src/dev.rs", 0, 2)).unwrap();

    store
        .upsert_visibility(seen("main", "src/lib.rs", 0, "fn alpha() {}", "c1"))
        .unwrap();
    store
        .upsert_visibility(seen("main", "src/main.rs", 0, "fn beta() {}", "c1"))
        .unwrap();
    // dev sees the same lib.rs blob: no new content record needed.
    assert_eq!(
        store
            .upsert_visibility(seen("dev", "src/lib.rs", 0, "fn alpha() {}", "c2"))
            .unwrap(),
        VisibilityOutcome::Created
    );
    store
        .upsert_visibility(seen("dev", "src/dev.rs", 0, "fn gamma() {}", "c2"))
        .unwrap();

    store.persist().await.unwrap();
    store
}

#[tokio::test]
async fn two_branches_share_content_and_search_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let key = collection_key("demo", "stub", "stub-model");
    let store = populate_two_branches(dir.path(), &key).await;

    // Three unique blobs across four visibility slots.
    assert_eq!(store.content_count(), 3);
    assert_eq!(store.visibility_count(), 4);

    let (hashes, vectors) = store.records_for_search();
    let index = HnswIndex::build(hashes, vectors, HnswConfig::default()).unwrap();
    index.save(&index_path(dir.path(), &key)).await.unwrap();

    let cache = HnswIndexCache::new(Duration::from_secs(300));
    let root = dir.path().to_path_buf();
    let collection = {
        let loader_key = key.clone();
        let loader_root = root.clone();
        cache
            .get_or_load(&key, move || async move {
                Ok(Arc::new(
                    load_collection(&loader_root, &loader_key, HnswConfig::default()).await?,
                ))
            })
            .await
            .unwrap()
    };

    let hits = collection
        .index()
        .unwrap()
        .search(&vector_for(1), 1, 100)
        .unwrap();
    assert_eq!(hits[0].0, content_hash("fn beta() {}"));
    let meta = collection.meta(&hits[0].0).unwrap();
    assert_eq!(meta.file_path, "src/main.rs");
    assert_eq!(meta.start_line, 1);

    // Second query for the same collection is served from the cache.
    {
        let loader_key = key.clone();
        let loader_root = root.clone();
        cache
            .get_or_load(&key, move || async move {
                Ok(Arc::new(
                    load_collection(&loader_root, &loader_key, HnswConfig::default()).await?,
                ))
            })
            .await
            .unwrap();
    }
    let stats = cache.get_stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 1);
    assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn deletion_keeps_shared_content_until_last_reference_drops() {
    let dir = tempfile::tempdir().unwrap();
    let key = collection_key("demo", "stub", "stub-model");
    let mut store = populate_two_branches(dir.path(), &key).await;

    // main deletes lib.rs; dev still sees the same blob.
    assert_eq!(store.remove_visibility("main", "src/lib.rs"), 1);
    assert_eq!(store.sweep_orphaned_content(), 0);
    assert!(store.has_content(&content_hash("fn alpha() {}")));

    // dev deletes it too; now the content is orphaned.
    assert_eq!(store.remove_visibility("dev", "src/lib.rs"), 1);
    assert_eq!(store.sweep_orphaned_content(), 1);
    assert!(!store.has_content(&content_hash("fn alpha() {}")));
    store.persist().await.unwrap();

    let reopened = VectorStore::open_existing(dir.path(), &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reopened.content_count(), 2);
    assert!(reopened.visible_paths("main").contains("src/main.rs"));
    assert!(!reopened.visible_paths("main").contains("src/lib.rs"));
}

#[tokio::test]
async fn stale_saved_index_is_rebuilt_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let key = collection_key("demo", "stub", "stub-model");
    let mut store = populate_two_branches(dir.path(), &key).await;

    let (hashes, vectors) = store.records_for_search();
    let index = HnswIndex::build(hashes, vectors, HnswConfig::default()).unwrap();
    index.save(&index_path(dir.path(), &key)).await.unwrap();

    // The store changes after the index file was written.
    store.insert_content(record("fn delta() {}", "src/extra.rs", 0, 5)).unwrap();
    store
        .upsert_visibility(seen("main", "src/extra.rs", 0, "fn delta() {}", "c3"))
        .unwrap();
    store.persist().await.unwrap();

    let collection = load_collection(dir.path(), &key, HnswConfig::default())
        .await
        .unwrap();
    assert_eq!(collection.index().unwrap().len(), 4);
    let hits = collection
        .index()
        .unwrap()
        .search(&vector_for(5), 1, 100)
        .unwrap();
    assert_eq!(hits[0].0, content_hash("fn delta() {}"));
}
