use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{IndexerError, Result};

/// Branch name assumed when the project is not a git repository.
pub const DEFAULT_BRANCH: &str = "main";

/// Repository identity observed at the start of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitStatus {
    pub git_available: bool,
    pub project_id: String,
    pub branch: String,
    /// Empty when no commit exists (fresh repo or no git).
    pub commit: String,
}

impl GitStatus {
    #[must_use]
    pub fn unavailable(project_id: impl Into<String>) -> Self {
        Self {
            git_available: false,
            project_id: project_id.into(),
            branch: DEFAULT_BRANCH.to_string(),
            commit: String::new(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> GitSnapshot {
        GitSnapshot {
            project_id: self.project_id.clone(),
            branch: self.branch.clone(),
            commit: self.commit.clone(),
        }
    }
}

/// The identity stamped into a persisted run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GitSnapshot {
    pub project_id: String,
    pub branch: String,
    pub commit: String,
}

/// File-level difference between a past commit and the working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitDelta {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl GitDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    #[must_use]
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Source of repository state for incremental indexing.
#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn status(&self) -> Result<GitStatus>;

    /// Paths changed between `commit` and the current working tree,
    /// including uncommitted and untracked files.
    async fn changed_since(&self, commit: &str) -> Result<GitDelta>;
}

/// `GitProvider` backed by the `git` binary. Absence of git, or of a
/// repository, degrades to [`GitStatus::unavailable`] rather than failing.
pub struct CliGitProvider {
    root: PathBuf,
}

impl CliGitProvider {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Runs git under the project root; `None` when git is missing or
    /// exits non-zero.
    async fn run(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            log::debug!(
                "git {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn project_id(&self) -> String {
        let canonical = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        project_id_from_dir(&canonical)
    }
}

#[async_trait]
impl GitProvider for CliGitProvider {
    async fn status(&self) -> Result<GitStatus> {
        let project_id = self.project_id();
        let commit = self.run(&["rev-parse", "HEAD"]).await;
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await;
        match (commit, branch) {
            (Some(commit), Some(branch)) if !commit.is_empty() => Ok(GitStatus {
                git_available: true,
                project_id,
                branch,
                commit,
            }),
            _ => Ok(GitStatus::unavailable(project_id)),
        }
    }

    async fn changed_since(&self, commit: &str) -> Result<GitDelta> {
        let diff = self
            .run(&["diff", "--name-status", commit])
            .await
            .ok_or_else(|| IndexerError::Git(format!("diff --name-status {commit} failed")))?;
        let mut delta = parse_name_status(&diff);

        // Untracked files never appear in a diff but are part of the
        // working tree the run must cover.
        if let Some(untracked) = self.run(&["ls-files", "--others", "--exclude-standard"]).await {
            for path in untracked.lines().map(str::trim).filter(|l| !l.is_empty()) {
                delta.added.push(path.to_string());
            }
        }

        delta.added.sort();
        delta.added.dedup();
        delta.modified.sort();
        delta.modified.dedup();
        delta.deleted.sort();
        delta.deleted.dedup();
        Ok(delta)
    }
}

/// Directory name of the project root, reduced to a collection-safe id.
#[must_use]
pub fn project_id_from_dir(root: &Path) -> String {
    let name = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}

/// Parses `git diff --name-status` output. Fields are tab-separated;
/// renames and copies carry two paths.
fn parse_name_status(output: &str) -> GitDelta {
    let mut delta = GitDelta::default();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let Some(code) = fields.next() else { continue };
        let Some(first) = fields.next() else { continue };
        let second = fields.next();

        match code.chars().next() {
            Some('A') => delta.added.push(first.to_string()),
            Some('D') => delta.deleted.push(first.to_string()),
            Some('R') => {
                delta.deleted.push(first.to_string());
                if let Some(new) = second {
                    delta.added.push(new.to_string());
                }
            }
            Some('C') => {
                if let Some(new) = second {
                    delta.added.push(new.to_string());
                }
            }
            // M, T (type change), U (unmerged) all mean re-read the file.
            Some(_) => delta.modified.push(first.to_string()),
            None => {}
        }
    }
    delta
}
