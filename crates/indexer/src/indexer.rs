use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use semdex_provider::{
    EmbeddingGate, EmbeddingProvider, RateLimiter, ThrottleMonitor, ThrottleStats,
};
use semdex_vector_store::{
    collection_key, content_hash, index_path, HnswIndex, HnswIndexCache, VectorStore,
};

use crate::branch::{BranchAwareIndexer, EmbeddedChunk, EmbeddedFile};
use crate::chunker::FileChunker;
use crate::config::IndexerConfig;
use crate::error::{IndexerError, Result};
use crate::git::{CliGitProvider, GitProvider, GitStatus};
use crate::guard::ConcurrencyGuard;
use crate::health::{
    append_failure_reason, read_health_snapshot, write_health_snapshot, HealthSnapshot,
    LeaseHealth, LeaseHealthState,
};
use crate::mode::{decide_mode, FullReason, IndexMode};
use crate::progress::ProgressiveMetadata;
use crate::scanner::{normalize_path, FileScanner};
use crate::stats::IndexingStats;
use crate::util::unix_now_ms;

/// Directory under the project root holding run metadata and, unless
/// overridden, the collection store.
pub const META_DIR_NAME: &str = ".semdex";

/// Invoked after every planned file, successful or not:
/// (attempted, planned, path, detail).
pub type ProgressCallback = Box<dyn Fn(usize, usize, &str, &str) + Send + Sync>;

/// Everything `execute_run` produced besides the record mutations.
struct RunReport {
    stats: IndexingStats,
    failures: Vec<String>,
}

/// The indexing engine for one project.
///
/// Each call to [`SmartIndexer::index`] claims the project lease, picks
/// a mode from the persisted run record (forced full, resume of an
/// interrupted run, first-time full, or incremental), embeds what the
/// store doesn't already hold, and leaves durable progress behind every
/// single file.
pub struct SmartIndexer {
    project_root: PathBuf,
    store_root: PathBuf,
    meta_dir: PathBuf,
    config: IndexerConfig,
    gate: Arc<EmbeddingGate>,
    git: Arc<dyn GitProvider>,
    progress_callback: Option<ProgressCallback>,
}

impl SmartIndexer {
    /// Wire an indexer to a project root and an embedding provider.
    /// Metadata and the store default to `<root>/.semdex/`.
    pub fn new(
        project_root: impl AsRef<Path>,
        provider: Arc<dyn EmbeddingProvider>,
        config: IndexerConfig,
    ) -> Result<Self> {
        let project_root = project_root.as_ref().to_path_buf();
        if !project_root.exists() {
            return Err(IndexerError::InvalidPath(format!(
                "path does not exist: {}",
                project_root.display()
            )));
        }
        config.validate()?;

        let gate = EmbeddingGate::new(
            provider,
            RateLimiter::new(&config.rate_limits()),
            ThrottleMonitor::new(config.throttle_window()),
            config.retry_policy(),
        );
        let meta_dir = project_root.join(META_DIR_NAME);
        let git = Arc::new(CliGitProvider::new(project_root.clone()));

        Ok(Self {
            project_root,
            store_root: meta_dir.clone(),
            meta_dir,
            config,
            gate: Arc::new(gate),
            git,
            progress_callback: None,
        })
    }

    /// Keep collections somewhere other than the project's meta dir.
    #[must_use]
    pub fn with_store_root(mut self, store_root: impl Into<PathBuf>) -> Self {
        self.store_root = store_root.into();
        self
    }

    /// Replace the git backend, e.g. with a fake in tests.
    #[must_use]
    pub fn with_git_provider(mut self, git: Arc<dyn GitProvider>) -> Self {
        self.git = git;
        self
    }

    #[must_use]
    pub fn with_progress_callback(
        mut self,
        callback: impl Fn(usize, usize, &str, &str) + Send + Sync + 'static,
    ) -> Self {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    #[must_use]
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    #[must_use]
    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.gate.provider_name()
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        self.gate.model()
    }

    /// Key of the collection this indexer writes, as consumed by the
    /// query path.
    pub async fn collection_key(&self) -> Result<String> {
        let status = self.git.status().await?;
        Ok(collection_key(
            &status.project_id,
            self.gate.provider_name(),
            self.gate.model(),
        ))
    }

    /// Current provider throttle classification and counters.
    pub async fn throttle_stats(&self) -> ThrottleStats {
        self.gate.throttle_stats().await
    }

    /// Index the project once.
    ///
    /// Mode decision order is fixed: `force_full` wins, then an
    /// interrupted run resumes, then a never-indexed collection gets a
    /// full build, and otherwise the run is incremental against the
    /// last completed commit.
    pub async fn index(
        &mut self,
        force_full: bool,
        batch_size: usize,
        vector_thread_count: usize,
    ) -> Result<IndexingStats> {
        if batch_size == 0 {
            return Err(IndexerError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if vector_thread_count == 0 {
            return Err(IndexerError::Configuration(
                "vector_thread_count must be at least 1".to_string(),
            ));
        }

        // 1. Identify the corpus before claiming anything.
        let status = self.git.status().await?;
        let key = collection_key(
            &status.project_id,
            self.gate.provider_name(),
            self.gate.model(),
        );
        log::info!(
            "indexing {} into {key} (branch {}, git {})",
            self.project_root.display(),
            status.branch,
            if status.git_available { "yes" } else { "no" },
        );

        // 2. Exclusivity first: no decision is made while another run
        //    owns the project.
        tokio::fs::create_dir_all(&self.meta_dir).await?;
        let guard = ConcurrencyGuard::new(
            &self.meta_dir,
            self.project_root.to_string_lossy(),
            self.config.lease_cooloff(),
        );
        guard.acquire().await?;
        let heartbeat = guard.spawn_heartbeat(self.config.heartbeat_interval());

        // 3. Load the run record. Corrupt metadata fails closed; only an
        //    explicit full reindex may discard it.
        let mut progress = match ProgressiveMetadata::load(&self.meta_dir, &key).await {
            Ok(progress) => progress,
            Err(IndexerError::CorruptMetadata(detail)) if force_full => {
                log::warn!("discarding corrupt run metadata under forced reindex: {detail}");
                ProgressiveMetadata::fresh(&self.meta_dir, &key)
            }
            Err(err) => {
                // Nothing was mutated; holding the project would only
                // delay the retry the caller now has to make.
                heartbeat.stop();
                guard.release().await?;
                return Err(err);
            }
        };

        let outcome = self
            .execute_run(
                &mut progress,
                &status,
                &key,
                force_full,
                batch_size,
                vector_thread_count,
            )
            .await;
        heartbeat.stop();

        match outcome {
            Ok(report) => {
                guard.release().await?;
                self.record_health(&guard, &progress, &report.failures).await?;
                log::info!("indexing completed: {:?}", report.stats);
                Ok(report.stats)
            }
            Err(err) => {
                // The lease stays in place: its expiry is the recovery
                // signal for the next run. Record what happened first.
                if let Err(meta_err) = progress.fail_indexing(&err.to_string()).await {
                    log::warn!("could not mark run failed: {meta_err}");
                }
                if let Err(health_err) = self
                    .record_health(&guard, &progress, &[err.to_string()])
                    .await
                {
                    log::warn!("could not write health snapshot: {health_err}");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    #[allow(clippy::cognitive_complexity)]
    async fn execute_run(
        &self,
        progress: &mut ProgressiveMetadata,
        status: &GitStatus,
        key: &str,
        force_full: bool,
        batch_size: usize,
        vector_thread_count: usize,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut stats = IndexingStats::new();
        let mut failures: Vec<String> = Vec::new();

        // 1. Pick the mode from prior run state.
        let mode = decide_mode(
            force_full,
            progress.can_resume_interrupted_operation(),
            progress.get_resume_timestamp(),
        );
        log::info!("run mode: {}", mode.describe());

        let scanner = FileScanner::new(&self.project_root, &self.config)?;
        let mut store = VectorStore::open(&self.store_root, key).await?;
        let index_file = index_path(&self.store_root, key);

        // 2. Build the work plan. Resume and incremental runs also
        //    collect the deletions that step 4 reconciles.
        let mut purged = false;
        let mut deletions: Vec<String> = Vec::new();
        let planned: Vec<String> = match mode {
            IndexMode::Full(reason) => {
                if matches!(reason, FullReason::NeverIndexed) {
                    log::info!("no completed run for {key}; indexing from scratch");
                }
                let planned = self.normalized(&scanner.scan());
                // The plan goes to disk before the purge: a crash
                // between the two leaves an InProgress run covering
                // every file, which the next invocation resumes.
                progress
                    .start_indexing(self.gate.provider_name(), self.gate.model(), status.snapshot())
                    .await?;
                progress.set_files_to_index(planned.clone()).await?;
                if store.content_count() > 0 || store.visibility_count() > 0 {
                    store.purge();
                    store.persist().await?;
                    remove_file_if_present(&index_file).await?;
                    purged = true;
                    log::info!("full reindex: dropped existing records for {key}");
                }
                planned
            }
            IndexMode::Resume => {
                // The interrupted run record is reused as-is; completed
                // files stay completed. Deletions are recomputed from
                // the live tree: files can vanish while a run sits
                // interrupted.
                let remaining = progress.get_remaining_files();
                let live: HashSet<String> = self.normalized(&scanner.scan()).into_iter().collect();
                deletions = stale_visible_paths(&store, &status.branch, &live);
                log::info!(
                    "resuming interrupted run: {} of {} files remaining, {} deleted",
                    remaining.len(),
                    progress.run().map_or(0, |run| run.files_to_index.len()),
                    deletions.len(),
                );
                remaining
            }
            IndexMode::Incremental => {
                let live: HashSet<String> = self.normalized(&scanner.scan()).into_iter().collect();
                let changed = self.incremental_changes(&scanner, status, progress, &live).await;
                // Anything visible on this branch but gone from the
                // working tree is a deletion, whatever git reported.
                deletions = stale_visible_paths(&store, &status.branch, &live);
                log::info!(
                    "incremental plan: {} changed, {} deleted",
                    changed.len(),
                    deletions.len(),
                );
                progress
                    .start_indexing(self.gate.provider_name(), self.gate.model(), status.snapshot())
                    .await?;
                progress.set_files_to_index(changed.clone()).await?;
                changed
            }
        };

        // 3. Read, chunk, and embed in waves of `vector_thread_count`
        //    files; the orchestrator alone writes the store.
        let total = planned.len();
        let mut attempted = 0usize;
        let chunker = FileChunker::new(self.config.chunk_chars, self.config.chunk_overlap_chars);

        for wave in planned.chunks(vector_thread_count) {
            // Hash snapshot for worker-side probes; refreshed per wave so
            // new inserts are visible to the next one. Probes are
            // advisory, the apply step re-checks.
            let known = Arc::new(store.content_hash_set());

            let mut tasks = Vec::with_capacity(wave.len());
            for rel in wave {
                let gate = Arc::clone(&self.gate);
                let known = Arc::clone(&known);
                let abs = self.project_root.join(rel);
                let rel = rel.clone();
                tasks.push((
                    rel.clone(),
                    tokio::spawn(async move {
                        embed_one_file(gate, known, chunker, abs, rel, batch_size).await
                    }),
                ));
            }

            for (rel, task) in tasks {
                let embedded = match task.await {
                    Ok(result) => result,
                    Err(err) => Err((rel, format!("worker panicked: {err}"))),
                };
                match embedded {
                    Ok(file) => {
                        let applied = BranchAwareIndexer::new(
                            &mut store,
                            self.gate.provider_name(),
                            self.gate.model(),
                        )
                        .apply_file(&file, &status.branch, &status.commit);
                        match applied {
                            Ok(outcome) => {
                                store.persist().await?;
                                progress
                                    .mark_file_completed(&file.path, outcome.chunk_count)
                                    .await?;
                                stats.add_file(&outcome);
                                attempted += 1;
                                self.report_progress(
                                    attempted,
                                    total,
                                    &file.path,
                                    &format!(
                                        "{} chunks ({} new, {} reused)",
                                        outcome.chunk_count,
                                        outcome.content_points_created,
                                        outcome.content_points_reused,
                                    ),
                                );
                            }
                            Err(err) => {
                                log::warn!("apply failed for {}: {err}", file.path);
                                stats.add_failure();
                                failures.push(format!("{}: {err}", file.path));
                                attempted += 1;
                                self.report_progress(attempted, total, &file.path, "failed");
                            }
                        }
                    }
                    Err((path, reason)) => {
                        log::warn!("embedding failed for {path}: {reason}");
                        stats.add_failure();
                        failures.push(format!("{path}: {reason}"));
                        attempted += 1;
                        self.report_progress(attempted, total, &path, "failed");
                    }
                }
            }
        }

        // 4. Apply deletions, then reclaim content nothing references.
        if !deletions.is_empty() {
            let removed = BranchAwareIndexer::new(
                &mut store,
                self.gate.provider_name(),
                self.gate.model(),
            )
            .apply_deletions(&deletions, &status.branch);
            log::info!(
                "removed {removed} visibility slots for {} deleted files",
                deletions.len(),
            );
        }
        let swept = store.sweep_orphaned_content();
        if swept > 0 {
            log::info!("swept {swept} orphaned content records");
        }
        store.persist().await?;

        // 5. Refresh the saved similarity index so the first query after
        //    this run skips the rebuild. Best effort: records are already
        //    durable and the query path can rebuild from them.
        let content_changed = purged || swept > 0 || stats.content_points_created > 0;
        if store.content_count() == 0 {
            remove_file_if_present(&index_file).await?;
        } else if content_changed {
            self.refresh_saved_index(&store, &index_file).await;
        }

        // 6. Close out the run record.
        if stats.files_failed == 0 {
            progress.complete_indexing().await?;
        } else {
            progress
                .fail_indexing(&format!("{} of {total} files failed", stats.files_failed))
                .await?;
        }

        #[allow(clippy::cast_possible_truncation)]
        {
            stats.processing_time_ms = started.elapsed().as_millis() as u64;
            if stats.processing_time_ms == 0 {
                stats.processing_time_ms = 1;
            }
        }
        Ok(RunReport { stats, failures })
    }

    /// Changed files for an incremental run: the git delta when an
    /// anchor commit exists, otherwise every live file modified since
    /// the last completed run.
    async fn incremental_changes(
        &self,
        scanner: &FileScanner,
        status: &GitStatus,
        progress: &ProgressiveMetadata,
        live: &HashSet<String>,
    ) -> Vec<String> {
        if status.git_available {
            if let Some(anchor) = progress.last_completed_commit() {
                match self.git.changed_since(anchor).await {
                    Ok(delta) => {
                        log::info!(
                            "git delta since {anchor}: {} added, {} modified, {} deleted",
                            delta.added.len(),
                            delta.modified.len(),
                            delta.deleted.len(),
                        );
                        let mut changed: Vec<String> = delta
                            .added
                            .into_iter()
                            .chain(delta.modified)
                            .filter(|path| live.contains(path))
                            .collect();
                        changed.sort();
                        changed.dedup();
                        return changed;
                    }
                    Err(err) => {
                        log::warn!("git delta failed ({err}); falling back to mtime scan");
                    }
                }
            }
        }
        let cutoff = progress.last_completed_at_ms().unwrap_or(0);
        self.normalized(&scanner.modified_since(cutoff))
    }

    async fn refresh_saved_index(&self, store: &VectorStore, index_file: &Path) {
        let (hashes, vectors) = store.records_for_search();
        let config = self.config.hnsw();
        let built =
            tokio::task::spawn_blocking(move || HnswIndex::build(hashes, vectors, config)).await;
        match built {
            Ok(Ok(index)) => {
                if let Err(err) = index.save(index_file).await {
                    log::warn!("could not save similarity index: {err}");
                } else {
                    log::debug!("saved similarity index to {}", index_file.display());
                }
            }
            Ok(Err(err)) => log::warn!("similarity index build failed: {err}"),
            Err(err) => log::warn!("similarity index build task failed: {err}"),
        }
    }

    /// Current operational picture: lease state, last completion, cache
    /// counters when the caller runs one, and recent failures.
    pub async fn health(&self, cache: Option<&HnswIndexCache>) -> Result<HealthSnapshot> {
        let guard = ConcurrencyGuard::new(
            &self.meta_dir,
            self.project_root.to_string_lossy(),
            self.config.lease_cooloff(),
        );
        let mut snapshot = read_health_snapshot(&self.meta_dir)
            .await?
            .unwrap_or_else(empty_snapshot);
        snapshot.generated_at_ms = unix_now_ms();
        snapshot.lease = LeaseHealth::from_status(&guard.inspect().await?);
        if let Some(cache) = cache {
            snapshot.cache = Some(cache.get_stats().into());
        }
        Ok(snapshot)
    }

    async fn record_health(
        &self,
        guard: &ConcurrencyGuard,
        progress: &ProgressiveMetadata,
        failures: &[String],
    ) -> Result<()> {
        let mut snapshot = read_health_snapshot(&self.meta_dir)
            .await?
            .unwrap_or_else(empty_snapshot);
        for failure in failures {
            append_failure_reason(&mut snapshot, failure.clone());
        }
        snapshot.generated_at_ms = unix_now_ms();
        snapshot.lease = LeaseHealth::from_status(&guard.inspect().await?);
        snapshot.last_completed_at_ms = progress
            .last_completed_at_ms()
            .or(snapshot.last_completed_at_ms);
        write_health_snapshot(&self.meta_dir, &snapshot).await
    }

    fn report_progress(&self, attempted: usize, total: usize, path: &str, detail: &str) {
        if let Some(callback) = &self.progress_callback {
            callback(attempted, total, path, detail);
        }
    }

    fn normalized(&self, paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|path| normalize_path(&self.project_root, path))
            .collect()
    }
}

fn empty_snapshot() -> HealthSnapshot {
    HealthSnapshot {
        generated_at_ms: 0,
        lease: LeaseHealth {
            state: LeaseHealthState::None,
            owner_pid: None,
            lease_age_ms: None,
        },
        last_completed_at_ms: None,
        cache: None,
        recent_failures: Vec::new(),
    }
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Paths visible on `branch` whose files are gone from the working tree.
fn stale_visible_paths(store: &VectorStore, branch: &str, live: &HashSet<String>) -> Vec<String> {
    store
        .visible_paths(branch)
        .into_iter()
        .filter(|path| !live.contains(path))
        .collect()
}

/// Read, chunk, hash, and embed one file off the orchestrator task.
///
/// Only hashes absent from the `known` snapshot are embedded, each once
/// per file, in batches of `batch_size`. A file that vanished before the
/// read comes back with zero chunks, which the apply step turns into a
/// removal; one that is not valid UTF-8 is skipped the same way.
async fn embed_one_file(
    gate: Arc<EmbeddingGate>,
    known: Arc<HashSet<String>>,
    chunker: FileChunker,
    abs: PathBuf,
    rel: String,
    batch_size: usize,
) -> std::result::Result<EmbeddedFile, (String, String)> {
    let content = match tokio::fs::read_to_string(&abs).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("{rel} vanished before read; treating as removed");
            return Ok(EmbeddedFile {
                path: rel,
                chunks: Vec::new(),
            });
        }
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            log::warn!("{rel} is not valid UTF-8; skipped");
            return Ok(EmbeddedFile {
                path: rel,
                chunks: Vec::new(),
            });
        }
        Err(err) => return Err((rel, format!("read failed: {err}"))),
    };

    // Hash every chunk, queueing the text of each hash to embed once.
    let text_chunks = chunker.chunk(&content);
    let mut chunks = Vec::with_capacity(text_chunks.len());
    let mut to_embed: Vec<(String, String)> = Vec::new();
    let mut queued: HashSet<String> = HashSet::new();
    for chunk in text_chunks {
        let hash = content_hash(&chunk.text);
        if !known.contains(&hash) && queued.insert(hash.clone()) {
            to_embed.push((hash.clone(), chunk.text));
        }
        chunks.push(EmbeddedChunk {
            chunk_index: chunk.chunk_index,
            content_hash: hash,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            vector: None,
        });
    }

    // Embed the missing hashes in bounded batches through the gate.
    let mut vectors: HashMap<String, Vec<f32>> = HashMap::with_capacity(to_embed.len());
    for batch in to_embed.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        let embedded = gate
            .embed_batch(&texts)
            .await
            .map_err(|err| (rel.clone(), format!("embedding failed: {err}")))?;
        for ((hash, _), vector) in batch.iter().zip(embedded) {
            vectors.insert(hash.clone(), vector);
        }
    }

    for chunk in &mut chunks {
        if let Some(vector) = vectors.get(&chunk.content_hash) {
            chunk.vector = Some(vector.clone());
        }
    }

    Ok(EmbeddedFile { path: rel, chunks })
}
