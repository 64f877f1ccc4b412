//! Durable record of the current indexing run.
//!
//! Every mutation persists before returning, so a crash at any point
//! leaves a readable record: an `InProgress` run with completed files
//! is the resume signal for the next attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::git::GitSnapshot;
use crate::util::{unix_now_ms, write_json_atomic};

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// One indexing run for a (project, provider, model) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IndexingRun {
    pub status: RunStatus,
    pub provider_name: String,
    pub model_name: String,
    pub git: GitSnapshot,
    /// Planned files in processing order, project-relative.
    pub files_to_index: Vec<String>,
    /// Completed file path to its chunk count.
    pub files_completed: HashMap<String, usize>,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ProgressFile {
    schema_version: u32,
    run: Option<IndexingRun>,
}

/// Persisted run state, one file per collection under the metadata dir.
pub struct ProgressiveMetadata {
    path: PathBuf,
    run: Option<IndexingRun>,
}

impl ProgressiveMetadata {
    #[must_use]
    pub fn file_path(meta_dir: &Path, collection_key: &str) -> PathBuf {
        meta_dir.join(format!("progress__{collection_key}.json"))
    }

    /// Load existing state. A missing file is an empty record; an
    /// unparseable or wrong-version file is [`IndexerError::CorruptMetadata`],
    /// never silently discarded.
    pub async fn load(meta_dir: &Path, collection_key: &str) -> Result<Self> {
        let path = Self::file_path(meta_dir, collection_key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { path, run: None });
            }
            Err(err) => return Err(err.into()),
        };
        let file: ProgressFile = serde_json::from_slice(&bytes).map_err(|err| {
            IndexerError::CorruptMetadata(format!("{}: {err}", path.display()))
        })?;
        if file.schema_version != PROGRESS_SCHEMA_VERSION {
            return Err(IndexerError::CorruptMetadata(format!(
                "{}: schema version {} (expected {PROGRESS_SCHEMA_VERSION})",
                path.display(),
                file.schema_version
            )));
        }
        Ok(Self { path, run: file.run })
    }

    /// Empty state that ignores whatever is on disk. Used to recover
    /// from corrupt metadata under an explicit full reindex.
    #[must_use]
    pub fn fresh(meta_dir: &Path, collection_key: &str) -> Self {
        Self {
            path: Self::file_path(meta_dir, collection_key),
            run: None,
        }
    }

    /// Begin a new run, replacing any previous record.
    pub async fn start_indexing(
        &mut self,
        provider_name: &str,
        model_name: &str,
        git: GitSnapshot,
    ) -> Result<()> {
        self.run = Some(IndexingRun {
            status: RunStatus::InProgress,
            provider_name: provider_name.to_string(),
            model_name: model_name.to_string(),
            git,
            files_to_index: Vec::new(),
            files_completed: HashMap::new(),
            started_at_ms: unix_now_ms(),
            completed_at_ms: None,
            failure_reason: None,
        });
        self.persist().await
    }

    pub async fn set_files_to_index(&mut self, files: Vec<String>) -> Result<()> {
        self.active_run()?.files_to_index = files;
        self.persist().await
    }

    /// Record one finished file. Persists before returning, so a crash
    /// immediately after never repeats this file.
    pub async fn mark_file_completed(&mut self, path: &str, chunk_count: usize) -> Result<()> {
        self.active_run()?
            .files_completed
            .insert(path.to_string(), chunk_count);
        self.persist().await
    }

    pub async fn complete_indexing(&mut self) -> Result<()> {
        let run = self.active_run()?;
        run.status = RunStatus::Completed;
        run.completed_at_ms = Some(unix_now_ms());
        run.failure_reason = None;
        self.persist().await
    }

    /// Terminal failure that keeps per-file completion state, so the
    /// next run can resume instead of starting over.
    pub async fn fail_indexing(&mut self, reason: &str) -> Result<()> {
        let run = self.active_run()?;
        run.status = RunStatus::Failed;
        run.completed_at_ms = None;
        run.failure_reason = Some(reason.to_string());
        self.persist().await
    }

    /// True when an interrupted or failed run still has planned files
    /// that never completed.
    #[must_use]
    pub fn can_resume_interrupted_operation(&self) -> bool {
        let Some(run) = &self.run else { return false };
        matches!(run.status, RunStatus::InProgress | RunStatus::Failed)
            && !self.get_remaining_files().is_empty()
    }

    /// Planned files not yet completed, in original order.
    #[must_use]
    pub fn get_remaining_files(&self) -> Vec<String> {
        let Some(run) = &self.run else {
            return Vec::new();
        };
        run.files_to_index
            .iter()
            .filter(|path| !run.files_completed.contains_key(*path))
            .cloned()
            .collect()
    }

    /// Completion time of the last successful run in unix seconds;
    /// 0.0 means this collection has never completed a run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_resume_timestamp(&self) -> f64 {
        self.last_completed_at_ms()
            .map_or(0.0, |ms| ms as f64 / 1000.0)
    }

    #[must_use]
    pub fn last_completed_at_ms(&self) -> Option<u64> {
        let run = self.run.as_ref()?;
        if run.status == RunStatus::Completed {
            run.completed_at_ms
        } else {
            None
        }
    }

    /// Commit recorded by the last completed run, the anchor for the
    /// next incremental delta.
    #[must_use]
    pub fn last_completed_commit(&self) -> Option<&str> {
        let run = self.run.as_ref()?;
        if run.status == RunStatus::Completed && !run.git.commit.is_empty() {
            Some(&run.git.commit)
        } else {
            None
        }
    }

    #[must_use]
    pub fn files_processed(&self) -> usize {
        self.run.as_ref().map_or(0, |run| run.files_completed.len())
    }

    #[must_use]
    pub fn run(&self) -> Option<&IndexingRun> {
        self.run.as_ref()
    }

    fn active_run(&mut self) -> Result<&mut IndexingRun> {
        self.run
            .as_mut()
            .ok_or_else(|| IndexerError::Other("no active indexing run".to_string()))
    }

    async fn persist(&self) -> Result<()> {
        let file = ProgressFile {
            schema_version: PROGRESS_SCHEMA_VERSION,
            run: self.run.clone(),
        };
        write_json_atomic(&self.path, &file).await
    }
}
