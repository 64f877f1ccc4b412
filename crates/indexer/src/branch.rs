use semdex_vector_store::{ContentRecord, VectorStore, VisibilityOutcome, VisibilityRecord};

use crate::error::{IndexerError, Result};
use crate::stats::FileOutcome;
use crate::util::unix_now_ms;

/// One chunk of a file after the embedding pass.
///
/// `vector` is `None` when the worker's probe found the hash already
/// stored, so no embedding was requested. The apply step re-probes; the
/// worker probe is advisory only.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk_index: usize,
    pub content_hash: String,
    pub start_line: usize,
    pub end_line: usize,
    pub vector: Option<Vec<f32>>,
}

/// A file whose chunks are ready to be written as records.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedFile {
    /// Project-relative path.
    pub path: String,
    pub chunks: Vec<EmbeddedChunk>,
}

/// Aggregate outcome of applying a batch of embedded files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchIndexingResult {
    pub content_points_created: usize,
    pub content_points_reused: usize,
    pub visibility_points_created: usize,
    pub visibility_points_updated: usize,
    pub files_applied: usize,
    /// Path and reason for every file that could not be applied.
    pub failed_files: Vec<(String, String)>,
}

impl BranchIndexingResult {
    fn absorb(&mut self, outcome: &FileOutcome) {
        self.content_points_created += outcome.content_points_created;
        self.content_points_reused += outcome.content_points_reused;
        self.visibility_points_created += outcome.visibility_points_created;
        self.visibility_points_updated += outcome.visibility_points_updated;
        self.files_applied += 1;
    }
}

/// Writes embedded files into the store as content plus visibility
/// records.
///
/// Content records are deduplicated by hash across branches, so
/// indexing a second branch that shares blobs creates per-branch
/// visibility pointers only.
pub struct BranchAwareIndexer<'store> {
    store: &'store mut VectorStore,
    provider_name: String,
    model_name: String,
}

impl<'store> BranchAwareIndexer<'store> {
    pub fn new(
        store: &'store mut VectorStore,
        provider_name: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider_name: provider_name.into(),
            model_name: model_name.into(),
        }
    }

    /// Apply every file in order, isolating failures: a file that
    /// cannot be written is recorded in `failed_files` and the batch
    /// continues. The store is mutated in memory only; persistence is
    /// the caller's step.
    pub fn index_branch_changes(
        &mut self,
        files: &[EmbeddedFile],
        branch: &str,
        commit: &str,
    ) -> BranchIndexingResult {
        let mut result = BranchIndexingResult::default();
        for file in files {
            match self.apply_file(file, branch, commit) {
                Ok(outcome) => result.absorb(&outcome),
                Err(err) => {
                    log::warn!("apply failed for {}: {err}", file.path);
                    result.failed_files.push((file.path.clone(), err.to_string()));
                }
            }
        }
        result
    }

    /// Write one file's chunks on `branch`, reusing stored content and
    /// pruning visibility slots past the file's current length.
    pub fn apply_file(
        &mut self,
        file: &EmbeddedFile,
        branch: &str,
        commit: &str,
    ) -> Result<FileOutcome> {
        let now_ms = unix_now_ms();
        let mut outcome = FileOutcome {
            chunk_count: file.chunks.len(),
            ..FileOutcome::default()
        };

        for chunk in &file.chunks {
            // The apply-time probe is authoritative. A worker probe can
            // go stale in one direction only (another file in the batch
            // stored the same hash first), which downgrades a create to
            // a reuse here.
            if self.store.has_content(&chunk.content_hash) {
                outcome.content_points_reused += 1;
            } else {
                let Some(vector) = chunk.vector.clone() else {
                    return Err(IndexerError::Other(format!(
                        "content {} for {} chunk {} vanished between probe and apply",
                        chunk.content_hash, file.path, chunk.chunk_index
                    )));
                };
                let created = self.store.insert_content(ContentRecord {
                    content_hash: chunk.content_hash.clone(),
                    vector,
                    file_path: file.path.clone(),
                    chunk_index: chunk.chunk_index,
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    provider_name: self.provider_name.clone(),
                    model_name: self.model_name.clone(),
                    created_at_ms: now_ms,
                })?;
                if created {
                    outcome.content_points_created += 1;
                } else {
                    outcome.content_points_reused += 1;
                }
            }

            match self.store.upsert_visibility(VisibilityRecord {
                branch: branch.to_string(),
                file_path: file.path.clone(),
                chunk_index: chunk.chunk_index,
                content_hash: chunk.content_hash.clone(),
                commit: commit.to_string(),
                updated_at_ms: now_ms,
            })? {
                VisibilityOutcome::Created => outcome.visibility_points_created += 1,
                VisibilityOutcome::Updated => outcome.visibility_points_updated += 1,
                VisibilityOutcome::Unchanged => {}
            }
        }

        // Slots past the current chunk count belong to an older, longer
        // version of the file.
        self.store
            .prune_file_chunks(branch, &file.path, file.chunks.len());
        Ok(outcome)
    }

    /// Drop visibility for deleted paths on `branch`. Content records
    /// stay until [`VectorStore::sweep_orphaned_content`] runs; another
    /// branch may still reference them.
    pub fn apply_deletions(&mut self, paths: &[String], branch: &str) -> usize {
        let mut removed_slots = 0;
        for path in paths {
            let removed = self.store.remove_visibility(branch, path);
            if removed > 0 {
                log::debug!("removed {removed} visibility slots for {path} on {branch}");
            }
            removed_slots += removed;
        }
        removed_slots
    }
}
