use serde::{Deserialize, Serialize};

/// Outcome counters for one indexing run.
///
/// Content points are deduplicated by hash, so `content_points_reused`
/// counts chunks whose embedding was already stored (typically from
/// another branch) and cost nothing to index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingStats {
    pub content_points_created: usize,
    pub content_points_reused: usize,
    pub visibility_points_created: usize,
    pub visibility_points_updated: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub processing_time_ms: u64,
}

impl IndexingStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one file's outcome into the run totals.
    pub fn add_file(&mut self, outcome: &FileOutcome) {
        self.content_points_created += outcome.content_points_created;
        self.content_points_reused += outcome.content_points_reused;
        self.visibility_points_created += outcome.visibility_points_created;
        self.visibility_points_updated += outcome.visibility_points_updated;
        self.files_processed += 1;
    }

    pub fn add_failure(&mut self) {
        self.files_failed += 1;
    }

    #[must_use]
    pub fn total_points_touched(&self) -> usize {
        self.content_points_created
            + self.content_points_reused
            + self.visibility_points_created
            + self.visibility_points_updated
    }
}

/// Store mutations caused by a single file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub chunk_count: usize,
    pub content_points_created: usize,
    pub content_points_reused: usize,
    pub visibility_points_created: usize,
    pub visibility_points_updated: usize,
}
