use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, VectorStoreError};
use crate::hnsw::{HnswConfig, HnswIndex};
use crate::store::VectorStore;

pub const INDEX_FILE_NAME: &str = "index.hnsw";

/// Placement of one content hash, for mapping hits back to files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub file_path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
}

/// A collection readied for queries: the similarity index plus the
/// metadata needed to turn neighbor hits into file results.
#[derive(Debug)]
pub struct LoadedCollection {
    key: String,
    index: Option<HnswIndex>,
    meta: HashMap<String, ChunkMeta>,
}

impl LoadedCollection {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// None means the collection has no embedded content yet.
    #[must_use]
    pub fn index(&self) -> Option<&HnswIndex> {
        self.index.as_ref()
    }

    #[must_use]
    pub fn meta(&self, hash: &str) -> Option<&ChunkMeta> {
        self.meta.get(hash)
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.meta.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }
}

/// Path of a collection's persisted index file.
#[must_use]
pub fn index_path(root: &Path, collection_key: &str) -> PathBuf {
    VectorStore::collection_dir(root, collection_key).join(INDEX_FILE_NAME)
}

/// Load a collection for querying.
///
/// Prefers the saved index file when it still matches the store
/// contents and rebuilds the graph from stored vectors otherwise.
/// A collection nobody has indexed yet loads as empty rather than
/// erroring. The rebuild is CPU-bound and runs on the blocking pool.
pub async fn load_collection(
    root: &Path,
    collection_key: &str,
    config: HnswConfig,
) -> Result<LoadedCollection> {
    let Some(store) = VectorStore::open_existing(root, collection_key).await? else {
        return Ok(LoadedCollection {
            key: collection_key.to_string(),
            index: None,
            meta: HashMap::new(),
        });
    };

    let (hashes, vectors) = store.records_for_search();
    let mut meta = HashMap::with_capacity(hashes.len());
    for record in store.content_records() {
        meta.insert(
            record.content_hash.clone(),
            ChunkMeta {
                file_path: record.file_path.clone(),
                chunk_index: record.chunk_index,
                start_line: record.start_line,
                end_line: record.end_line,
            },
        );
    }
    if hashes.is_empty() {
        return Ok(LoadedCollection {
            key: collection_key.to_string(),
            index: None,
            meta,
        });
    }

    let path = index_path(root, collection_key);
    let key = collection_key.to_string();
    let index =
        tokio::task::spawn_blocking(move || load_or_rebuild(&path, &key, hashes, vectors, config))
            .await
            .map_err(|e| VectorStoreError::Other(format!("collection load task failed: {e}")))??;

    Ok(LoadedCollection {
        key: collection_key.to_string(),
        index: Some(index),
        meta,
    })
}

fn load_or_rebuild(
    path: &Path,
    key: &str,
    hashes: Vec<String>,
    vectors: Vec<Vec<f32>>,
    config: HnswConfig,
) -> Result<HnswIndex> {
    if path.exists() {
        match HnswIndex::load(path) {
            Ok(index) if index.matches(&hashes) => {
                log::debug!("loaded saved index for {key} ({} records)", index.len());
                return Ok(index);
            }
            Ok(index) => {
                log::info!(
                    "saved index for {key} is stale ({} records vs {} in store), rebuilding",
                    index.len(),
                    hashes.len()
                );
            }
            Err(error) => {
                log::warn!("failed to load saved index for {key}: {error}, rebuilding");
            }
        }
    }
    HnswIndex::build(hashes, vectors, config)
}
