use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell};

use crate::collection::LoadedCollection;
use crate::error::Result;

/// Cache effectiveness counters. Monotonic for the cache's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_ratio: f64,
}

struct Slot {
    cell: OnceCell<Arc<LoadedCollection>>,
    // milliseconds since the cache epoch
    last_access: AtomicU64,
}

/// Keyed cache of loaded collections with single-flight loading.
///
/// Each key holds a `OnceCell`: concurrent callers missing the same
/// key coalesce onto one in-flight load instead of rebuilding the
/// graph N times. Entries idle past the TTL are evicted lazily on
/// next access or through `sweep_idle`.
///
/// There is no global instance. Whoever serves queries constructs one
/// and passes it where needed; tests build their own.
pub struct HnswIndexCache {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    ttl: Duration,
    epoch: Instant,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl HnswIndexCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
            epoch: Instant::now(),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    fn is_expired(&self, slot: &Slot, now_ms: u64) -> bool {
        now_ms.saturating_sub(slot.last_access.load(Ordering::Acquire)) > self.ttl_ms()
    }

    /// Return the cached collection for `key`, or run `loader` once to
    /// fill it. Concurrent callers for the same missing key wait on
    /// the winner's load.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<Arc<LoadedCollection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<LoadedCollection>>>,
    {
        let now = self.now_ms();
        let slot = {
            let mut slots = self.slots.lock().await;
            if let Some(existing) = slots.get(key) {
                if self.is_expired(existing, now) {
                    slots.remove(key);
                }
            }
            Arc::clone(slots.entry(key.to_string()).or_insert_with(|| {
                Arc::new(Slot {
                    cell: OnceCell::new(),
                    last_access: AtomicU64::new(now),
                })
            }))
        };

        // Only the closure's winner flips this; coalesced waiters and
        // plain hits leave it false.
        let mut loaded_here = false;
        let outcome = slot
            .cell
            .get_or_try_init(|| {
                loaded_here = true;
                loader()
            })
            .await;

        match outcome {
            Ok(collection) => {
                slot.last_access.store(self.now_ms(), Ordering::Release);
                if loaded_here {
                    self.miss_count.fetch_add(1, Ordering::Relaxed);
                    log::debug!("collection cache miss: {key}");
                } else {
                    self.hit_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Arc::clone(collection))
            }
            Err(error) => {
                // Failed loads leave the cell empty so the next caller
                // retries.
                if loaded_here {
                    self.miss_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(error)
            }
        }
    }

    #[must_use]
    pub fn get_stats(&self) -> CacheStats {
        let hit_count = self.hit_count.load(Ordering::Relaxed);
        let miss_count = self.miss_count.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        #[allow(clippy::cast_precision_loss)]
        let hit_ratio = if total == 0 {
            0.0
        } else {
            hit_count as f64 / total as f64
        };
        CacheStats {
            hit_count,
            miss_count,
            hit_ratio,
        }
    }

    /// Drop every entry idle past the TTL. Returns how many were
    /// evicted.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.now_ms();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| !self.is_expired(slot, now));
        let evicted = before - slots.len();
        if evicted > 0 {
            log::debug!("evicted {evicted} idle collection cache entries");
        }
        evicted
    }

    /// Clear all entries and counters.
    pub async fn reset(&self) {
        let mut slots = self.slots.lock().await;
        slots.clear();
        self.hit_count.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
    }

    pub async fn resident_entries(&self) -> usize {
        self.slots.lock().await.len()
    }
}
