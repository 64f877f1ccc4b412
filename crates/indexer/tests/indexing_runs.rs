//! End-to-end indexing runs over a real temp project, with a scripted
//! embedding provider and repository state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use semdex_indexer::{
    unix_now_ms, ConcurrencyGuard, GitDelta, GitProvider, GitSnapshot, GitStatus, HeartbeatLease,
    IndexerConfig, IndexerError, IndexingRun, ProgressiveMetadata, RunStatus, SmartIndexer,
    LEASE_FILE_NAME, META_DIR_NAME,
};
use semdex_provider::{EmbeddingProvider, ProviderError};
use semdex_vector_store::{index_path, VectorStore};
use tempfile::TempDir;

fn vector_for(text: &str) -> Vec<f32> {
    let sum: u32 = text.bytes().map(u32::from).sum();
    vec![(sum % 97) as f32 + 1.0, text.len() as f32, 1.0, 0.5]
}

/// Deterministic provider. Texts marked via [`StubProvider::poison`]
/// fail the whole batch with an auth error, which the gate does not
/// retry.
struct StubProvider {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    poisoned: Mutex<HashSet<String>>,
}

impl StubProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            poisoned: Mutex::new(HashSet::new()),
        })
    }

    fn poison(&self, text: &str) {
        self.poisoned.lock().unwrap().insert(text.to_string());
    }

    fn heal(&self) {
        self.poisoned.lock().unwrap().clear();
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn batch_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    async fn get_embedding(&self, text: &str) -> semdex_provider::Result<Vec<f32>> {
        Ok(vector_for(text))
    }

    async fn get_embeddings_batch(
        &self,
        texts: &[String],
    ) -> semdex_provider::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts
            .iter()
            .any(|text| self.poisoned.lock().unwrap().contains(text))
        {
            return Err(ProviderError::Auth("credentials rejected".to_string()));
        }
        self.seen.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|text| vector_for(text)).collect())
    }

    fn get_provider_name(&self) -> &str {
        "stub"
    }

    fn get_current_model(&self) -> &str {
        "stub-model"
    }
}

/// Scriptable repository state standing in for the git CLI.
struct FakeGit {
    status: Mutex<GitStatus>,
    delta: Mutex<GitDelta>,
}

impl FakeGit {
    fn new(branch: &str, commit: &str) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(GitStatus {
                git_available: true,
                project_id: "proj".to_string(),
                branch: branch.to_string(),
                commit: commit.to_string(),
            }),
            delta: Mutex::new(GitDelta::default()),
        })
    }

    fn set_head(&self, branch: &str, commit: &str) {
        let mut status = self.status.lock().unwrap();
        status.branch = branch.to_string();
        status.commit = commit.to_string();
    }

    fn set_delta(&self, delta: GitDelta) {
        *self.delta.lock().unwrap() = delta;
    }
}

#[async_trait]
impl GitProvider for FakeGit {
    async fn status(&self) -> semdex_indexer::Result<GitStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn changed_since(&self, _commit: &str) -> semdex_indexer::Result<GitDelta> {
        Ok(self.delta.lock().unwrap().clone())
    }
}

fn test_config() -> IndexerConfig {
    IndexerConfig {
        batch_size: 8,
        vector_thread_count: 2,
        chunk_chars: 64,
        chunk_overlap_chars: 0,
        ..IndexerConfig::default()
    }
}

struct Project {
    root: TempDir,
    store_root: TempDir,
    provider: Arc<StubProvider>,
    git: Arc<FakeGit>,
}

impl Project {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            store_root: tempfile::tempdir().unwrap(),
            provider: StubProvider::new(),
            git: FakeGit::new("main", "c1"),
        }
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.root.path().join(name), content).unwrap();
    }

    fn remove(&self, name: &str) {
        std::fs::remove_file(self.root.path().join(name)).unwrap();
    }

    fn indexer(&self) -> SmartIndexer {
        SmartIndexer::new(self.root.path(), self.provider.clone(), test_config())
            .unwrap()
            .with_store_root(self.store_root.path())
            .with_git_provider(self.git.clone())
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.path().join(META_DIR_NAME)
    }

    async fn key(&self) -> String {
        self.indexer().collection_key().await.unwrap()
    }

    async fn open_store(&self, key: &str) -> VectorStore {
        VectorStore::open(self.store_root.path(), key).await.unwrap()
    }

    async fn run_record(&self, key: &str) -> IndexingRun {
        ProgressiveMetadata::load(&self.meta_dir(), key)
            .await
            .unwrap()
            .run()
            .cloned()
            .unwrap()
    }
}

// 112 chars: two 64-char windows under the test config.
fn alpha_content() -> String {
    "fn alpha() {}\n".repeat(8)
}

const BETA_CONTENT: &str = "# beta\n\nnotes about the beta module\n";

#[tokio::test]
async fn full_index_embeds_every_chunk_and_completes_the_run() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    let stats = project.indexer().index(false, 8, 2).await.unwrap();

    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.files_failed, 0);
    assert_eq!(stats.content_points_created, 3);
    assert_eq!(stats.content_points_reused, 0);
    assert_eq!(stats.visibility_points_created, 3);
    assert!(stats.processing_time_ms >= 1);

    // Each distinct chunk was embedded exactly once.
    let seen = project.provider.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 3);

    // The run completed, the lease is gone, and the store plus saved
    // similarity index are on disk.
    let key = project.key().await;
    let run = project.run_record(&key).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.files_completed.len(), 2);
    assert!(!project.meta_dir().join(LEASE_FILE_NAME).exists());

    let store = project.open_store(&key).await;
    assert_eq!(store.content_count(), 3);
    let visible: Vec<String> = store.visible_paths("main").into_iter().collect();
    assert_eq!(visible, vec!["alpha.rs".to_string(), "beta.md".to_string()]);
    assert!(index_path(project.store_root.path(), &key).exists());
}

#[tokio::test]
async fn rerun_with_no_changes_plans_nothing() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    project.indexer().index(false, 8, 2).await.unwrap();
    let calls_after_first = project.provider.batch_calls();

    // Same commit, empty delta: the second run has nothing to do.
    let stats = project.indexer().index(false, 8, 2).await.unwrap();

    assert_eq!(stats.files_processed, 0);
    assert_eq!(stats.total_points_touched(), 0);
    assert_eq!(project.provider.batch_calls(), calls_after_first);

    let key = project.key().await;
    assert_eq!(project.run_record(&key).await.status, RunStatus::Completed);
}

#[tokio::test]
async fn second_runner_is_rejected_while_lease_is_held() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());

    let guard = ConcurrencyGuard::new(
        &project.meta_dir(),
        project.root.path().to_string_lossy(),
        test_config().lease_cooloff(),
    );
    guard.acquire().await.unwrap();

    let err = project.indexer().index(false, 8, 2).await.unwrap_err();
    match err {
        IndexerError::AlreadyIndexing { holder_pid, .. } => {
            assert_eq!(holder_pid, std::process::id());
        }
        other => panic!("expected AlreadyIndexing, got {other}"),
    }

    // The holder's lease was not disturbed.
    assert!(project.meta_dir().join(LEASE_FILE_NAME).exists());
    guard.release().await.unwrap();
}

#[tokio::test]
async fn stale_lease_does_not_block_a_new_run() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());

    let cooloff_ms = test_config().lease_cooloff().as_millis() as u64;
    let now = unix_now_ms();
    let lease = HeartbeatLease {
        owner_pid: std::process::id(),
        hostname: "elsewhere".to_string(),
        started_at_ms: now.saturating_sub(cooloff_ms + 60_000),
        last_heartbeat_ms: now.saturating_sub(cooloff_ms + 30_000),
        project_path: project.root.path().to_string_lossy().into_owned(),
    };
    std::fs::create_dir_all(project.meta_dir()).unwrap();
    std::fs::write(
        project.meta_dir().join(LEASE_FILE_NAME),
        serde_json::to_vec_pretty(&lease).unwrap(),
    )
    .unwrap();

    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 1);
    assert!(!project.meta_dir().join(LEASE_FILE_NAME).exists());
}

#[tokio::test]
async fn interrupted_run_resumes_only_remaining_files() {
    let project = Project::new();
    for name in ["a.rs", "b.rs", "c.rs", "d.rs"] {
        project.write(name, &format!("// body of {name}\n"));
    }
    let key = project.key().await;

    // A run that died after finishing a.rs and b.rs.
    let mut progress = ProgressiveMetadata::fresh(&project.meta_dir(), &key);
    progress
        .start_indexing(
            "stub",
            "stub-model",
            GitSnapshot {
                project_id: "proj".to_string(),
                branch: "main".to_string(),
                commit: "c1".to_string(),
            },
        )
        .await
        .unwrap();
    progress
        .set_files_to_index(vec![
            "a.rs".to_string(),
            "b.rs".to_string(),
            "c.rs".to_string(),
            "d.rs".to_string(),
        ])
        .await
        .unwrap();
    progress.mark_file_completed("a.rs", 1).await.unwrap();
    progress.mark_file_completed("b.rs", 1).await.unwrap();

    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 2);

    // Only the unfinished files were embedded.
    let seen = project.provider.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|text| !text.contains("a.rs")));
    assert!(seen.iter().all(|text| !text.contains("b.rs")));
    assert!(seen.iter().any(|text| text.contains("c.rs")));
    assert!(seen.iter().any(|text| text.contains("d.rs")));

    let run = project.run_record(&key).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.files_completed.len(), 4);
}

#[tokio::test]
async fn failed_file_marks_run_failed_then_resume_finishes_it() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);
    project.provider.poison(BETA_CONTENT);

    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.files_failed, 1);

    let key = project.key().await;
    let run = project.run_record(&key).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("1 of 2 files failed"));
    assert_eq!(run.files_completed.len(), 1);

    // The failure landed in the health report.
    let health = project.indexer().health(None).await.unwrap();
    assert!(health
        .recent_failures
        .iter()
        .any(|reason| reason.contains("beta.md")));

    // Provider recovers; the next run picks up only the failed file.
    project.provider.heal();
    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.files_failed, 0);
    assert_eq!(stats.content_points_created, 1);

    let run = project.run_record(&key).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.files_completed.len(), 2);
}

#[tokio::test]
async fn branch_switch_reuses_content_and_adds_visibility() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    project.indexer().index(false, 8, 2).await.unwrap();
    let embeds_after_first = project.provider.seen().len();

    // Same trees on a new branch: every chunk hash is already stored.
    project.git.set_head("dev", "c2");
    project.git.set_delta(GitDelta {
        modified: vec!["alpha.rs".to_string(), "beta.md".to_string()],
        ..GitDelta::default()
    });

    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.content_points_created, 0);
    assert_eq!(stats.content_points_reused, 3);
    assert_eq!(stats.visibility_points_created, 3);
    assert_eq!(project.provider.seen().len(), embeds_after_first);

    let key = project.key().await;
    let store = project.open_store(&key).await;
    assert_eq!(store.content_count(), 3);
    assert_eq!(store.visible_paths("main").len(), 2);
    assert_eq!(store.visible_paths("dev").len(), 2);
}

#[tokio::test]
async fn deleted_file_drops_visibility_and_sweeps_content() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    project.indexer().index(false, 8, 2).await.unwrap();

    project.remove("beta.md");
    project.git.set_head("main", "c2");
    project.git.set_delta(GitDelta {
        deleted: vec!["beta.md".to_string()],
        ..GitDelta::default()
    });

    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 0);

    let key = project.key().await;
    let store = project.open_store(&key).await;
    let visible: Vec<String> = store.visible_paths("main").into_iter().collect();
    assert_eq!(visible, vec!["alpha.rs".to_string()]);
    // Nothing references beta's chunk anymore, so its content is gone.
    assert_eq!(store.content_count(), 2);
}

#[tokio::test]
async fn force_full_purges_and_rebuilds_the_collection() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    project.indexer().index(false, 8, 2).await.unwrap();

    // Forced rebuild: old records are dropped, everything re-embeds.
    let stats = project.indexer().index(true, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.content_points_created, 3);
    assert_eq!(stats.content_points_reused, 0);

    let key = project.key().await;
    let store = project.open_store(&key).await;
    assert_eq!(store.content_count(), 3);
    assert_eq!(store.visibility_count(), 3);
}

#[tokio::test]
async fn run_interrupted_right_after_purge_rebuilds_on_resume() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    project.indexer().index(false, 8, 2).await.unwrap();
    let key = project.key().await;

    // A forced rebuild that died right after wiping the store: the
    // planned run record is on disk with nothing completed, and the
    // collection plus its saved index are gone.
    let mut progress = ProgressiveMetadata::load(&project.meta_dir(), &key)
        .await
        .unwrap();
    progress
        .start_indexing(
            "stub",
            "stub-model",
            GitSnapshot {
                project_id: "proj".to_string(),
                branch: "main".to_string(),
                commit: "c1".to_string(),
            },
        )
        .await
        .unwrap();
    progress
        .set_files_to_index(vec!["alpha.rs".to_string(), "beta.md".to_string()])
        .await
        .unwrap();
    let mut store = project.open_store(&key).await;
    store.purge();
    store.persist().await.unwrap();
    std::fs::remove_file(index_path(project.store_root.path(), &key)).unwrap();

    // The next plain run resumes the planned files and re-embeds them
    // all instead of trusting the emptied store.
    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.content_points_created, 3);

    let run = project.run_record(&key).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.files_completed.len(), 2);

    let store = project.open_store(&key).await;
    assert_eq!(store.content_count(), 3);
    assert_eq!(store.visible_paths("main").len(), 2);
    assert!(index_path(project.store_root.path(), &key).exists());
}

#[tokio::test]
async fn resumed_run_reconciles_files_deleted_while_interrupted() {
    let project = Project::new();
    project.write("alpha.rs", &alpha_content());
    project.write("beta.md", BETA_CONTENT);

    project.indexer().index(false, 8, 2).await.unwrap();
    let key = project.key().await;

    // beta.md is deleted while an interrupted run plans only alpha.rs.
    project.remove("beta.md");
    let mut progress = ProgressiveMetadata::load(&project.meta_dir(), &key)
        .await
        .unwrap();
    progress
        .start_indexing(
            "stub",
            "stub-model",
            GitSnapshot {
                project_id: "proj".to_string(),
                branch: "main".to_string(),
                commit: "c1".to_string(),
            },
        )
        .await
        .unwrap();
    progress
        .set_files_to_index(vec!["alpha.rs".to_string()])
        .await
        .unwrap();

    let stats = project.indexer().index(false, 8, 2).await.unwrap();
    assert_eq!(stats.files_processed, 1);

    let run = project.run_record(&key).await;
    assert_eq!(run.status, RunStatus::Completed);

    // The resumed run still dropped the deleted file's visibility and
    // swept its now-unreferenced content.
    let store = project.open_store(&key).await;
    let visible: Vec<String> = store.visible_paths("main").into_iter().collect();
    assert_eq!(visible, vec!["alpha.rs".to_string()]);
    assert_eq!(store.content_count(), 2);
}
