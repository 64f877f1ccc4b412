//! Operator-facing health snapshot.
//!
//! One JSON file per project metadata dir, rewritten at the end of every
//! run and readable at any time, including while a run is in flight or
//! after a crash.

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use semdex_vector_store::CacheStats;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::guard::LeaseStatus;
use crate::util::write_json_atomic;

pub const HEALTH_FILE_NAME: &str = "health.json";

/// Failure log entries kept in a snapshot, newest last.
pub const MAX_RECENT_FAILURES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeaseHealthState {
    Running,
    Stale,
    None,
    Unreadable,
}

/// Lease view embedded in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LeaseHealth {
    pub state: LeaseHealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_age_ms: Option<u64>,
}

impl LeaseHealth {
    #[must_use]
    pub fn from_status(status: &LeaseStatus) -> Self {
        match status {
            LeaseStatus::None => Self {
                state: LeaseHealthState::None,
                owner_pid: None,
                lease_age_ms: None,
            },
            LeaseStatus::Running { lease, age_ms } => Self {
                state: LeaseHealthState::Running,
                owner_pid: Some(lease.owner_pid),
                lease_age_ms: Some(*age_ms),
            },
            LeaseStatus::Stale { lease, age_ms, .. } => Self {
                state: LeaseHealthState::Stale,
                owner_pid: Some(lease.owner_pid),
                lease_age_ms: Some(*age_ms),
            },
            LeaseStatus::Unreadable { age_ms, .. } => Self {
                state: LeaseHealthState::Unreadable,
                owner_pid: None,
                lease_age_ms: *age_ms,
            },
        }
    }
}

/// Cache counters in persistable form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CacheHealth {
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_ratio: f64,
}

impl From<CacheStats> for CacheHealth {
    fn from(stats: CacheStats) -> Self {
        Self {
            hit_count: stats.hit_count,
            miss_count: stats.miss_count,
            hit_ratio: stats.hit_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthSnapshot {
    pub generated_at_ms: u64,
    pub lease: LeaseHealth,
    pub last_completed_at_ms: Option<u64>,
    pub cache: Option<CacheHealth>,
    /// Newest last, capped at [`MAX_RECENT_FAILURES`].
    pub recent_failures: Vec<String>,
}

#[must_use]
pub fn health_file_path(meta_dir: &Path) -> PathBuf {
    meta_dir.join(HEALTH_FILE_NAME)
}

pub async fn write_health_snapshot(meta_dir: &Path, snapshot: &HealthSnapshot) -> Result<()> {
    write_json_atomic(&health_file_path(meta_dir), snapshot).await
}

/// Read the last written snapshot. A missing or unparseable file reads
/// as `None`; health reporting never blocks on its own history.
pub async fn read_health_snapshot(meta_dir: &Path) -> Result<Option<HealthSnapshot>> {
    let path = health_file_path(meta_dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(err) => {
            log::warn!("discarding unreadable health snapshot {}: {err}", path.display());
            Ok(None)
        }
    }
}

/// Append one failure, evicting the oldest entries past the cap.
pub fn append_failure_reason(snapshot: &mut HealthSnapshot, reason: impl Into<String>) {
    snapshot.recent_failures.push(reason.into());
    let len = snapshot.recent_failures.len();
    if len > MAX_RECENT_FAILURES {
        snapshot.recent_failures.drain(..len - MAX_RECENT_FAILURES);
    }
}
