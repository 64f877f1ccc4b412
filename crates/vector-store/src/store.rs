use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorStoreError};
use crate::record::{ContentRecord, VisibilityKey, VisibilityRecord};

const CONTENT_FILE_NAME: &str = "content.json";
const VISIBILITY_FILE_NAME: &str = "visibility.json";
const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ContentFile {
    schema_version: u32,
    dimension: Option<usize>,
    records: Vec<ContentRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VisibilityFile {
    schema_version: u32,
    records: Vec<VisibilityRecord>,
}

/// Result of writing a visibility record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityOutcome {
    /// No record existed for this (branch, path, chunk) slot.
    Created,
    /// The slot existed but pointed at different content.
    Updated,
    /// The slot already pointed at this content; nothing written.
    Unchanged,
}

/// Durable record store for one collection.
///
/// Content records are keyed by hash and deduplicated globally;
/// visibility records map (branch, path, chunk) slots onto them.
/// Mutations are in-memory; `persist` writes both record files with
/// the tmp-then-rename dance so readers never observe a torn file.
pub struct VectorStore {
    dir: PathBuf,
    collection_key: String,
    dimension: Option<usize>,
    content: BTreeMap<String, ContentRecord>,
    visibility: HashMap<VisibilityKey, VisibilityRecord>,
}

impl VectorStore {
    /// Directory holding one collection's record files.
    #[must_use]
    pub fn collection_dir(root: &Path, collection_key: &str) -> PathBuf {
        root.join("collections").join(collection_key)
    }

    /// Open a collection, creating its directory if needed.
    pub async fn open(root: &Path, collection_key: &str) -> Result<Self> {
        let dir = Self::collection_dir(root, collection_key);
        tokio::fs::create_dir_all(&dir).await?;
        match Self::load_from(&dir, collection_key).await? {
            Some(store) => Ok(store),
            None => Ok(Self {
                dir,
                collection_key: collection_key.to_string(),
                dimension: None,
                content: BTreeMap::new(),
                visibility: HashMap::new(),
            }),
        }
    }

    /// Open a collection only if it was persisted before.
    ///
    /// The query path uses this: a collection nobody indexed yet is not
    /// an error, it just has nothing to return.
    pub async fn open_existing(root: &Path, collection_key: &str) -> Result<Option<Self>> {
        let dir = Self::collection_dir(root, collection_key);
        Self::load_from(&dir, collection_key).await
    }

    async fn load_from(dir: &Path, collection_key: &str) -> Result<Option<Self>> {
        let content_path = dir.join(CONTENT_FILE_NAME);
        if !content_path.exists() {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&content_path).await?;
        let content_file: ContentFile = serde_json::from_slice(&bytes)?;
        if content_file.schema_version != STORE_SCHEMA_VERSION {
            return Err(VectorStoreError::CorruptIndex {
                path: content_path,
                detail: format!(
                    "unsupported store schema version {}",
                    content_file.schema_version
                ),
            });
        }

        let visibility_path = dir.join(VISIBILITY_FILE_NAME);
        let visibility_records = if visibility_path.exists() {
            let bytes = tokio::fs::read(&visibility_path).await?;
            let file: VisibilityFile = serde_json::from_slice(&bytes)?;
            if file.schema_version != STORE_SCHEMA_VERSION {
                return Err(VectorStoreError::CorruptIndex {
                    path: visibility_path,
                    detail: format!("unsupported store schema version {}", file.schema_version),
                });
            }
            file.records
        } else {
            Vec::new()
        };

        let dimension = content_file
            .dimension
            .or_else(|| content_file.records.first().map(|r| r.vector.len()));
        let mut content = BTreeMap::new();
        for record in content_file.records {
            if let Some(expected) = dimension {
                if record.vector.len() != expected {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected,
                        found: record.vector.len(),
                    });
                }
            }
            content.insert(record.content_hash.clone(), record);
        }
        let mut visibility = HashMap::new();
        for record in visibility_records {
            visibility.insert(record.key(), record);
        }

        Ok(Some(Self {
            dir: dir.to_path_buf(),
            collection_key: collection_key.to_string(),
            dimension,
            content,
            visibility,
        }))
    }

    #[must_use]
    pub fn collection_key(&self) -> &str {
        &self.collection_key
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Dimension pinned by the first inserted vector, if any.
    #[must_use]
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    #[must_use]
    pub fn content_count(&self) -> usize {
        self.content.len()
    }

    #[must_use]
    pub fn visibility_count(&self) -> usize {
        self.visibility.len()
    }

    #[must_use]
    pub fn has_content(&self, hash: &str) -> bool {
        self.content.contains_key(hash)
    }

    #[must_use]
    pub fn content(&self, hash: &str) -> Option<&ContentRecord> {
        self.content.get(hash)
    }

    pub fn content_records(&self) -> impl Iterator<Item = &ContentRecord> {
        self.content.values()
    }

    /// Snapshot of every stored content hash, for worker-side probes.
    #[must_use]
    pub fn content_hash_set(&self) -> HashSet<String> {
        self.content.keys().cloned().collect()
    }

    /// Insert a content record unless its hash is already present.
    ///
    /// Returns false for a duplicate; the stored record wins and the
    /// argument is dropped. The first inserted vector pins the
    /// collection dimension.
    pub fn insert_content(&mut self, record: ContentRecord) -> Result<bool> {
        if record.vector.is_empty() {
            return Err(VectorStoreError::InvalidParameter {
                field: "vector",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(expected) = self.dimension {
            if record.vector.len() != expected {
                return Err(VectorStoreError::DimensionMismatch {
                    expected,
                    found: record.vector.len(),
                });
            }
        }
        if self.content.contains_key(&record.content_hash) {
            return Ok(false);
        }
        if self.dimension.is_none() {
            self.dimension = Some(record.vector.len());
        }
        self.content.insert(record.content_hash.clone(), record);
        Ok(true)
    }

    /// Point a (branch, path, chunk) slot at a stored content record,
    /// last writer wins.
    pub fn upsert_visibility(&mut self, record: VisibilityRecord) -> Result<VisibilityOutcome> {
        if !self.content.contains_key(&record.content_hash) {
            return Err(VectorStoreError::UnknownContent(record.content_hash));
        }
        match self.visibility.get(&record.key()) {
            None => {
                self.visibility.insert(record.key(), record);
                Ok(VisibilityOutcome::Created)
            }
            Some(existing) if existing.content_hash == record.content_hash => {
                Ok(VisibilityOutcome::Unchanged)
            }
            Some(_) => {
                self.visibility.insert(record.key(), record);
                Ok(VisibilityOutcome::Updated)
            }
        }
    }

    /// Remove every visibility record for a file on one branch.
    /// Returns the number of chunk slots removed.
    pub fn remove_visibility(&mut self, branch: &str, file_path: &str) -> usize {
        let before = self.visibility.len();
        self.visibility
            .retain(|(b, p, _), _| !(b == branch && p == file_path));
        before - self.visibility.len()
    }

    /// Drop visibility records past `keep_chunks` for a file that
    /// shrank. Returns the number removed.
    pub fn prune_file_chunks(&mut self, branch: &str, file_path: &str, keep_chunks: usize) -> usize {
        let before = self.visibility.len();
        self.visibility
            .retain(|(b, p, chunk), _| !(b == branch && p == file_path && *chunk >= keep_chunks));
        before - self.visibility.len()
    }

    /// Paths currently visible on a branch, sorted and deduplicated.
    #[must_use]
    pub fn visible_paths(&self, branch: &str) -> BTreeSet<String> {
        self.visibility
            .keys()
            .filter(|(b, _, _)| b == branch)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    /// Content hashes and vectors in stable hash order, aligned by
    /// position, for index construction.
    #[must_use]
    pub fn records_for_search(&self) -> (Vec<String>, Vec<Vec<f32>>) {
        let mut hashes = Vec::with_capacity(self.content.len());
        let mut vectors = Vec::with_capacity(self.content.len());
        for (hash, record) in &self.content {
            hashes.push(hash.clone());
            vectors.push(record.vector.clone());
        }
        (hashes, vectors)
    }

    /// Drop all records and the dimension pin. Used by forced full
    /// reindexing.
    pub fn purge(&mut self) {
        self.content.clear();
        self.visibility.clear();
        self.dimension = None;
    }

    /// Remove content records no visibility record references.
    ///
    /// Deletions never remove content eagerly, so orphans accumulate
    /// until this sweep runs. Returns the number removed.
    pub fn sweep_orphaned_content(&mut self) -> usize {
        let referenced: HashSet<&str> = self
            .visibility
            .values()
            .map(|record| record.content_hash.as_str())
            .collect();
        let before = self.content.len();
        self.content.retain(|hash, _| referenced.contains(hash.as_str()));
        let removed = before - self.content.len();
        if removed > 0 {
            log::debug!(
                "swept {removed} orphaned content records from {}",
                self.collection_key
            );
        }
        removed
    }

    /// Write both record files atomically (tmp then rename), records
    /// in a deterministic order.
    pub async fn persist(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let content_file = ContentFile {
            schema_version: STORE_SCHEMA_VERSION,
            dimension: self.dimension,
            records: self.content.values().cloned().collect(),
        };
        write_json_atomic(&self.dir.join(CONTENT_FILE_NAME), &content_file).await?;

        let mut records: Vec<VisibilityRecord> = self.visibility.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        let visibility_file = VisibilityFile {
            schema_version: STORE_SCHEMA_VERSION,
            records,
        };
        write_json_atomic(&self.dir.join(VISIBILITY_FILE_NAME), &visibility_file).await?;
        Ok(())
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
