//! # Semdex Indexer
//!
//! Project indexing for semantic code search.
//!
//! ## Pipeline
//!
//! ```text
//! Project directory
//!     │
//!     ├──> ConcurrencyGuard (heartbeat lease, one run per project)
//!     │
//!     ├──> mode decision (forced full | resume | first full | incremental)
//!     │      └─> ProgressiveMetadata (durable per-file run record)
//!     │
//!     ├──> FileScanner (.gitignore aware) ──> FileChunker
//!     │      └─> chunk hashes, embedded through the provider gate
//!     │
//!     └──> BranchAwareIndexer
//!            └─> content records (hash-deduped) + per-branch visibility
//! ```
//!
//! A crash at any point leaves a resumable run record behind; the next
//! call picks up the remaining files instead of starting over.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use semdex_indexer::{IndexerConfig, SmartIndexer};
//! use semdex_provider::EmbeddingProvider;
//!
//! async fn run(provider: Arc<dyn EmbeddingProvider>) -> anyhow::Result<()> {
//!     let config = IndexerConfig::default();
//!     let batch = config.batch_size;
//!     let workers = config.vector_thread_count;
//!
//!     let mut indexer = SmartIndexer::new("/path/to/project", provider, config)?;
//!     let stats = indexer.index(false, batch, workers).await?;
//!
//!     println!(
//!         "indexed {} files ({} new chunks, {} reused)",
//!         stats.files_processed, stats.content_points_created, stats.content_points_reused
//!     );
//!     Ok(())
//! }
//! ```

mod branch;
mod chunker;
mod config;
mod error;
mod git;
mod guard;
mod health;
mod indexer;
mod mode;
mod progress;
mod scanner;
mod stats;
mod util;

pub use branch::{BranchAwareIndexer, BranchIndexingResult, EmbeddedChunk, EmbeddedFile};
pub use chunker::{FileChunker, TextChunk};
pub use config::IndexerConfig;
pub use error::{IndexerError, Result};
pub use git::{
    project_id_from_dir, CliGitProvider, GitDelta, GitProvider, GitSnapshot, GitStatus,
    DEFAULT_BRANCH,
};
pub use guard::{
    assess_lease, ConcurrencyGuard, HeartbeatLease, HeartbeatTask, LeaseStaleReason, LeaseStatus,
    LEASE_FILE_NAME,
};
pub use health::{
    append_failure_reason, health_file_path, read_health_snapshot, write_health_snapshot,
    CacheHealth, HealthSnapshot, LeaseHealth, LeaseHealthState, HEALTH_FILE_NAME,
    MAX_RECENT_FAILURES,
};
pub use indexer::{ProgressCallback, SmartIndexer, META_DIR_NAME};
pub use mode::{decide_mode, FullReason, IndexMode};
pub use progress::{
    IndexingRun, ProgressiveMetadata, RunStatus, PROGRESS_SCHEMA_VERSION,
};
pub use scanner::{normalize_path, FileScanner};
pub use stats::{FileOutcome, IndexingStats};
pub use util::unix_now_ms;
