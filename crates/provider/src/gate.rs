use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProviderError, Result};
use crate::provider::{estimate_batch_tokens, EmbeddingProvider};
use crate::rate_limit::RateLimiter;
use crate::throttle::{ThrottleMonitor, ThrottleState, ThrottleStats};

/// Bounded retry schedule for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each
    /// time and capped at `max_delay`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

/// The only path to a provider: every embedding call is budgeted
/// against the rate limiter, observed by the throttle monitor, and
/// retried a bounded number of times on transient failure.
///
/// The limiter is consulted once per attempt. The gate sleeps out the
/// reported wait, then proceeds even if that drives a bucket negative;
/// the deficit floor in [`RateLimiter`] keeps later waits finite.
pub struct EmbeddingGate {
    provider: Arc<dyn EmbeddingProvider>,
    limiter: RateLimiter,
    monitor: ThrottleMonitor,
    retry: RetryPolicy,
}

impl EmbeddingGate {
    #[must_use]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        limiter: RateLimiter,
        monitor: ThrottleMonitor,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            limiter,
            monitor,
            retry,
        }
    }

    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.get_provider_name()
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.provider.get_current_model()
    }

    pub async fn throttle_state(&self) -> ThrottleState {
        self.monitor.state().await
    }

    pub async fn throttle_stats(&self) -> ThrottleStats {
        self.monitor.get_stats().await
    }

    /// Embed a batch of texts, one vector per input, in input order.
    ///
    /// Rate-limit and network failures are retried with exponential
    /// backoff up to the policy's attempt budget; auth and malformed
    /// responses fail immediately.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let estimated = estimate_batch_tokens(texts);
        let mut attempt: u32 = 0;
        loop {
            // 1. Budget the call against the local limiter.
            let wait = self.limiter.wait_time(estimated).await;
            if !wait.is_zero() {
                self.monitor.record_wait(wait).await;
                log::debug!("rate limiter backoff: sleeping {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
            self.limiter.consume_tokens(estimated).await;

            // 2. Call the provider and sort failures by retryability.
            attempt += 1;
            match self.provider.get_embeddings_batch(texts).await {
                Ok(vectors) => {
                    if vectors.len() != texts.len() {
                        return Err(ProviderError::InvalidResponse(format!(
                            "expected {} vectors, got {}",
                            texts.len(),
                            vectors.len()
                        )));
                    }
                    return Ok(vectors);
                }
                Err(ProviderError::RateLimited { retry_after }) => {
                    self.monitor.record_server_throttle().await;
                    if attempt >= self.retry.max_attempts {
                        return Err(ProviderError::RateLimited { retry_after });
                    }
                    let delay = retry_after.unwrap_or_else(|| self.retry.backoff_delay(attempt));
                    log::warn!(
                        "provider throttled (attempt {attempt}/{}), retrying in {}ms",
                        self.retry.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ProviderError::Network(message)) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ProviderError::Network(message));
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    log::warn!(
                        "provider network error (attempt {attempt}/{}): {message}, retrying in {}ms",
                        self.retry.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
