//! Cross-process mutual exclusion for indexing runs.
//!
//! One lease file per project. The owner refreshes `last_heartbeat_ms`
//! on a fixed cadence; any other process treats the lease as stale once
//! the heartbeat is older than the cooloff, or immediately when the
//! owner is a dead pid on the same host. A crashed owner therefore
//! blocks successors for at most one cooloff period.

use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{IndexerError, Result};
use crate::util::{unix_now_ms, write_json_atomic};

pub const LEASE_FILE_NAME: &str = "lease.json";

/// On-disk claim that one process is currently indexing a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HeartbeatLease {
    pub owner_pid: u32,
    pub hostname: String,
    pub started_at_ms: u64,
    pub last_heartbeat_ms: u64,
    pub project_path: String,
}

impl HeartbeatLease {
    fn claim(project_path: &str, now_ms: u64) -> Self {
        Self {
            owner_pid: std::process::id(),
            hostname: hostname(),
            started_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
            project_path: project_path.to_string(),
        }
    }

    /// Milliseconds since the owner last checked in.
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_heartbeat_ms)
    }

    fn is_ours(&self) -> bool {
        self.owner_pid == std::process::id() && self.hostname == hostname()
    }
}

/// Why a lease no longer protects its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStaleReason {
    /// No heartbeat within the cooloff window.
    HeartbeatExpired,
    /// Owner pid is gone on this host, regardless of heartbeat age.
    OwnerDead,
}

/// Staleness predicate over an observed lease. `owner_alive` is `None`
/// when the owner runs on another host and cannot be probed; such a
/// lease stays protected until its heartbeat expires.
#[must_use]
pub fn assess_lease(
    lease: &HeartbeatLease,
    now_ms: u64,
    cooloff_ms: u64,
    owner_alive: Option<bool>,
) -> Option<LeaseStaleReason> {
    if lease.age_ms(now_ms) > cooloff_ms {
        return Some(LeaseStaleReason::HeartbeatExpired);
    }
    if owner_alive == Some(false) {
        return Some(LeaseStaleReason::OwnerDead);
    }
    None
}

/// What [`ConcurrencyGuard::inspect`] observed at the lease path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    None,
    Running {
        lease: HeartbeatLease,
        age_ms: u64,
    },
    Stale {
        lease: HeartbeatLease,
        age_ms: u64,
        reason: LeaseStaleReason,
    },
    /// Present but unparseable. `age_ms` is taken from the file mtime.
    Unreadable {
        detail: String,
        age_ms: Option<u64>,
    },
}

/// Acquires and maintains the per-project heartbeat lease.
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    lease_path: PathBuf,
    project_path: String,
    cooloff: Duration,
}

impl ConcurrencyGuard {
    pub fn new(meta_dir: &Path, project_path: impl Into<String>, cooloff: Duration) -> Self {
        Self {
            lease_path: meta_dir.join(LEASE_FILE_NAME),
            project_path: project_path.into(),
            cooloff,
        }
    }

    #[must_use]
    pub fn lease_path(&self) -> &Path {
        &self.lease_path
    }

    /// Claim the lease, recovering a stale one. A live lease fails with
    /// [`IndexerError::AlreadyIndexing`].
    pub async fn acquire(&self) -> Result<()> {
        match self.inspect().await? {
            LeaseStatus::None => self.write_claim().await,
            LeaseStatus::Running { lease, age_ms } => Err(IndexerError::AlreadyIndexing {
                holder_pid: lease.owner_pid,
                age_ms,
            }),
            LeaseStatus::Stale { lease, age_ms, reason } => {
                log::warn!(
                    "recovering stale lease (pid {}, {age_ms}ms old, {reason:?})",
                    lease.owner_pid
                );
                self.write_claim().await
            }
            LeaseStatus::Unreadable { detail, age_ms } => {
                // An unparseable lease cannot prove its owner is alive.
                // Trust the file mtime: younger than the cooloff means a
                // writer may still be around.
                let age = age_ms.unwrap_or(0);
                if age > cooloff_ms(self.cooloff) {
                    log::warn!("replacing unreadable lease ({detail}, {age}ms old)");
                    self.write_claim().await
                } else {
                    Err(IndexerError::AlreadyIndexing {
                        holder_pid: 0,
                        age_ms: age,
                    })
                }
            }
        }
    }

    /// Refresh `last_heartbeat_ms` on a lease we own. A vanished lease
    /// is re-claimed; a lease taken over by another process is left
    /// alone and logged, never overwritten.
    pub async fn heartbeat(&self) -> Result<()> {
        match self.read_lease().await? {
            Some(Ok(mut lease)) if lease.is_ours() => {
                lease.last_heartbeat_ms = unix_now_ms();
                write_json_atomic(&self.lease_path, &lease).await
            }
            Some(Ok(lease)) => {
                log::error!(
                    "lease superseded by pid {} on {}; heartbeat skipped",
                    lease.owner_pid,
                    lease.hostname
                );
                Ok(())
            }
            Some(Err(detail)) => {
                log::warn!("lease unreadable during heartbeat ({detail}); re-claiming");
                self.write_claim().await
            }
            None => {
                log::warn!("lease file disappeared mid-run; re-claiming");
                self.write_claim().await
            }
        }
    }

    /// Delete the lease. Missing files are fine; release is idempotent.
    pub async fn release(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.lease_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Report the lease state without mutating anything.
    pub async fn inspect(&self) -> Result<LeaseStatus> {
        let now = unix_now_ms();
        match self.read_lease().await? {
            None => Ok(LeaseStatus::None),
            Some(Err(detail)) => Ok(LeaseStatus::Unreadable {
                detail,
                age_ms: self.file_age_ms(now).await,
            }),
            Some(Ok(lease)) => {
                let owner_alive = (lease.hostname == hostname())
                    .then(|| is_pid_alive(lease.owner_pid));
                let age_ms = lease.age_ms(now);
                match assess_lease(&lease, now, cooloff_ms(self.cooloff), owner_alive) {
                    Some(reason) => Ok(LeaseStatus::Stale { lease, age_ms, reason }),
                    None => Ok(LeaseStatus::Running { lease, age_ms }),
                }
            }
        }
    }

    /// Spawn a background task refreshing the lease every `interval`.
    /// The task stops when the returned handle drops.
    #[must_use]
    pub fn spawn_heartbeat(&self, interval: Duration) -> HeartbeatTask {
        let guard = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = guard.heartbeat().await {
                    log::warn!("heartbeat write failed: {err}");
                }
            }
        });
        HeartbeatTask { handle }
    }

    async fn write_claim(&self) -> Result<()> {
        let lease = HeartbeatLease::claim(&self.project_path, unix_now_ms());
        write_json_atomic(&self.lease_path, &lease).await
    }

    /// `None` → no file; `Some(Err)` → present but unparseable.
    async fn read_lease(&self) -> Result<Option<std::result::Result<HeartbeatLease, String>>> {
        match tokio::fs::read(&self.lease_path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|err| err.to_string()),
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn file_age_ms(&self, now_ms: u64) -> Option<u64> {
        let meta = tokio::fs::metadata(&self.lease_path).await.ok()?;
        let mtime = meta.modified().ok()?;
        let mtime_ms = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX))?;
        Some(now_ms.saturating_sub(mtime_ms))
    }
}

/// Aborts the heartbeat loop when dropped.
#[derive(Debug)]
pub struct HeartbeatTask {
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn cooloff_ms(cooloff: Duration) -> u64 {
    u64::try_from(cooloff.as_millis()).unwrap_or(u64::MAX)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    // No portable probe; rely on heartbeat expiry alone.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lease(pid: u32, host: &str, heartbeat_ms: u64) -> HeartbeatLease {
        HeartbeatLease {
            owner_pid: pid,
            hostname: host.to_string(),
            started_at_ms: heartbeat_ms,
            last_heartbeat_ms: heartbeat_ms,
            project_path: "/tmp/project".to_string(),
        }
    }

    #[test]
    fn fresh_lease_with_live_owner_is_protected() {
        let lease = lease(42, "host-a", 10_000);
        assert_eq!(assess_lease(&lease, 11_000, 120_000, Some(true)), None);
    }

    #[test]
    fn expired_heartbeat_is_stale_even_if_owner_lives() {
        let lease = lease(42, "host-a", 10_000);
        assert_eq!(
            assess_lease(&lease, 200_000, 120_000, Some(true)),
            Some(LeaseStaleReason::HeartbeatExpired)
        );
    }

    #[test]
    fn dead_same_host_owner_is_stale_immediately() {
        let lease = lease(42, "host-a", 10_000);
        assert_eq!(
            assess_lease(&lease, 11_000, 120_000, Some(false)),
            Some(LeaseStaleReason::OwnerDead)
        );
    }

    #[test]
    fn cross_host_owner_is_protected_until_expiry() {
        let lease = lease(42, "other-host", 10_000);
        assert_eq!(assess_lease(&lease, 11_000, 120_000, None), None);
        assert_eq!(
            assess_lease(&lease, 131_001, 120_000, None),
            Some(LeaseStaleReason::HeartbeatExpired)
        );
    }

    #[tokio::test]
    async fn second_acquire_is_rejected_while_owner_lives() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));
        guard.acquire().await.unwrap();

        let rival = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));
        match rival.acquire().await {
            Err(IndexerError::AlreadyIndexing { holder_pid, .. }) => {
                assert_eq!(holder_pid, std::process::id());
            }
            other => panic!("expected AlreadyIndexing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));

        let old = lease(std::process::id(), &hostname(), unix_now_ms() - 300_000);
        std::fs::write(guard.lease_path(), serde_json::to_vec(&old).unwrap()).unwrap();

        guard.acquire().await.unwrap();
        match guard.inspect().await.unwrap() {
            LeaseStatus::Running { lease, .. } => {
                assert_eq!(lease.owner_pid, std::process::id());
            }
            other => panic!("expected a fresh running lease, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dead_pid_lease_is_taken_over_despite_fresh_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));

        // u32::MAX exceeds any real pid, so the owner reads as dead.
        let ghost = lease(u32::MAX, &hostname(), unix_now_ms());
        std::fs::write(guard.lease_path(), serde_json::to_vec(&ghost).unwrap()).unwrap();

        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_young_lease_blocks_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));
        std::fs::write(guard.lease_path(), b"not json").unwrap();

        assert!(matches!(
            guard.inspect().await.unwrap(),
            LeaseStatus::Unreadable { .. }
        ));
        assert!(matches!(
            guard.acquire().await,
            Err(IndexerError::AlreadyIndexing { holder_pid: 0, .. })
        ));
    }

    #[tokio::test]
    async fn heartbeat_refreshes_without_touching_started_at() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));
        guard.acquire().await.unwrap();

        let before: HeartbeatLease =
            serde_json::from_slice(&std::fs::read(guard.lease_path()).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        guard.heartbeat().await.unwrap();
        let after: HeartbeatLease =
            serde_json::from_slice(&std::fs::read(guard.lease_path()).unwrap()).unwrap();

        assert_eq!(after.started_at_ms, before.started_at_ms);
        assert!(after.last_heartbeat_ms >= before.last_heartbeat_ms);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConcurrencyGuard::new(dir.path(), "/p", Duration::from_secs(120));
        guard.acquire().await.unwrap();

        guard.release().await.unwrap();
        guard.release().await.unwrap();
        assert_eq!(guard.inspect().await.unwrap(), LeaseStatus::None);
    }
}
