use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Requests-per-minute and tokens-per-minute budget for one provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
        }
    }
}

const REFILL_PERIOD_MS: f64 = 60_000.0;

/// One token bucket. The level may go negative down to `-capacity`,
/// which bounds the worst-case wait at roughly two refill periods.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    capacity: f64,
    level: f64,
    last_refill_ms: u64,
}

impl Bucket {
    fn new(capacity: f64) -> Self {
        Self {
            capacity,
            level: capacity,
            last_refill_ms: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        self.last_refill_ms = now_ms;
        let replenished = elapsed / REFILL_PERIOD_MS * self.capacity;
        self.level = (self.level + replenished).min(self.capacity);
    }

    fn consume(&mut self, amount: f64) {
        self.level = (self.level - amount).max(-self.capacity);
    }

    /// Milliseconds until `amount` units are available. The amount is
    /// clamped to capacity so a single oversized call waits for a full
    /// bucket instead of forever.
    fn wait_ms(&self, amount: f64) -> f64 {
        let needed = amount.min(self.capacity) - self.level;
        if needed <= 0.0 {
            return 0.0;
        }
        needed / self.capacity * REFILL_PERIOD_MS
    }
}

/// Bucket pair driven by an explicit clock so tests can step time.
#[derive(Debug)]
struct Buckets {
    requests: Bucket,
    tokens: Bucket,
}

impl Buckets {
    #[allow(clippy::cast_precision_loss)]
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            requests: Bucket::new(f64::from(config.requests_per_minute)),
            tokens: Bucket::new(config.tokens_per_minute as f64),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn can_make(&mut self, now_ms: u64, estimated_tokens: u64) -> bool {
        self.requests.refill(now_ms);
        self.tokens.refill(now_ms);
        self.requests.level >= 1.0 && self.tokens.level >= estimated_tokens as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn wait_ms(&mut self, now_ms: u64, estimated_tokens: u64) -> f64 {
        self.requests.refill(now_ms);
        self.tokens.refill(now_ms);
        let request_wait = self.requests.wait_ms(1.0);
        let token_wait = self.tokens.wait_ms(estimated_tokens as f64);
        request_wait.max(token_wait)
    }

    #[allow(clippy::cast_precision_loss)]
    fn consume_tokens(&mut self, now_ms: u64, actual_tokens: u64) {
        self.requests.refill(now_ms);
        self.tokens.refill(now_ms);
        self.requests.consume(1.0);
        self.tokens.consume(actual_tokens as f64);
    }
}

/// Dual token-bucket limiter covering requests/minute and tokens/minute.
///
/// A call may proceed only when both buckets can afford it; the
/// reported wait is the larger of the two deficits.
pub struct RateLimiter {
    buckets: Mutex<Buckets>,
    epoch: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets::new(config)),
            epoch: Instant::now(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Whether one request costing `estimated_tokens` fits both
    /// buckets right now.
    pub async fn can_make_request(&self, estimated_tokens: u64) -> bool {
        let now = self.now_ms();
        let mut buckets = self.buckets.lock().await;
        buckets.can_make(now, estimated_tokens)
    }

    /// How long the caller should sleep before `consume_tokens` for a
    /// call costing `estimated_tokens`. Zero when both buckets have
    /// room.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn wait_time(&self, estimated_tokens: u64) -> Duration {
        let now = self.now_ms();
        let mut buckets = self.buckets.lock().await;
        Duration::from_millis(buckets.wait_ms(now, estimated_tokens).ceil() as u64)
    }

    /// Record one request and its token cost against both buckets.
    pub async fn consume_tokens(&self, actual_tokens: u64) {
        let now = self.now_ms();
        let mut buckets = self.buckets.lock().await;
        buckets.consume_tokens(now, actual_tokens);
    }
}
