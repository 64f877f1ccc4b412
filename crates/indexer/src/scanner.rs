use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::config::IndexerConfig;
use crate::error::{IndexerError, Result};

/// Walks a project tree and yields the files eligible for indexing.
///
/// Discovery respects `.gitignore` and skips hidden entries, then applies
/// the configured extension allow-list, exclude globs, and size cap.
pub struct FileScanner {
    root: PathBuf,
    extensions: HashSet<String>,
    excludes: GlobSet,
    max_file_bytes: u64,
}

impl FileScanner {
    pub fn new(root: impl Into<PathBuf>, config: &IndexerConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|err| {
                IndexerError::Configuration(format!("invalid exclude pattern `{pattern}`: {err}"))
            })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|err| IndexerError::Configuration(format!("exclude patterns: {err}")))?;

        Ok(Self {
            root: root.into(),
            extensions: config
                .include_extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            excludes,
            max_file_bytes: config.max_file_bytes,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every eligible file under the root, sorted for deterministic runs.
    #[must_use]
    pub fn scan(&self) -> Vec<PathBuf> {
        self.scan_filtered(|_| true)
    }

    /// Eligible files whose mtime is strictly after `cutoff_ms` (unix ms).
    /// A cutoff of 0 returns everything `scan` would.
    #[must_use]
    pub fn modified_since(&self, cutoff_ms: u64) -> Vec<PathBuf> {
        self.scan_filtered(|meta| mtime_ms(meta) > cutoff_ms)
    }

    fn scan_filtered(&self, keep: impl Fn(&Metadata) -> bool) -> Vec<PathBuf> {
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .follow_links(false)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::debug!("scan: skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ty| ty.is_file()) {
                continue;
            }
            if !self.is_eligible(entry.path()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.len() > self.max_file_bytes {
                log::debug!("scan: {} exceeds size cap, skipped", entry.path().display());
                continue;
            }
            if keep(&meta) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        files
    }

    fn is_eligible(&self, path: &Path) -> bool {
        let has_known_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()));
        if !has_known_extension {
            return false;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        !self.excludes.is_match(relative)
    }
}

/// Project-relative path with forward slashes, the form stored in records.
#[must_use]
pub fn normalize_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

fn mtime_ms(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX))
}
