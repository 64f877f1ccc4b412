use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Observed provider pressure, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    /// The provider said stop: at least one 429 in the window.
    ServerThrottled,
    /// Our own limiter is the bottleneck: frequent, long local waits.
    ClientThrottled,
    /// No recent pressure.
    FullSpeed,
}

/// Window snapshot for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStats {
    pub state: ThrottleState,
    pub recent_wait_count: usize,
    pub recent_throttle_count: usize,
    pub average_wait_ms: f64,
}

/// More than this many waits in the window counts as frequent.
const CLIENT_WAIT_COUNT_THRESHOLD: usize = 5;
/// Average wait above this counts as long.
const CLIENT_WAIT_AVG_MS_THRESHOLD: f64 = 500.0;

/// Sliding window of throttle evidence driven by an explicit clock.
///
/// Events older than the window are purged lazily on every query, so
/// recovery to `FullSpeed` needs no timer: time passing is enough.
#[derive(Debug)]
struct Window {
    window_ms: u64,
    // (recorded_at_ms, wait_ms)
    wait_events: VecDeque<(u64, u64)>,
    server_events: VecDeque<u64>,
}

impl Window {
    fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            wait_events: VecDeque::new(),
            server_events: VecDeque::new(),
        }
    }

    fn purge(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while self.wait_events.front().is_some_and(|(at, _)| *at < cutoff) {
            self.wait_events.pop_front();
        }
        while self.server_events.front().is_some_and(|at| *at < cutoff) {
            self.server_events.pop_front();
        }
    }

    fn record_wait(&mut self, now_ms: u64, wait_ms: u64) {
        self.purge(now_ms);
        self.wait_events.push_back((now_ms, wait_ms));
    }

    fn record_server_throttle(&mut self, now_ms: u64) {
        self.purge(now_ms);
        self.server_events.push_back(now_ms);
    }

    #[allow(clippy::cast_precision_loss)]
    fn average_wait_ms(&self) -> f64 {
        if self.wait_events.is_empty() {
            return 0.0;
        }
        let total: u64 = self.wait_events.iter().map(|(_, w)| w).sum();
        total as f64 / self.wait_events.len() as f64
    }

    fn classify(&mut self, now_ms: u64) -> ThrottleState {
        self.purge(now_ms);
        if !self.server_events.is_empty() {
            return ThrottleState::ServerThrottled;
        }
        if self.wait_events.len() > CLIENT_WAIT_COUNT_THRESHOLD
            && self.average_wait_ms() > CLIENT_WAIT_AVG_MS_THRESHOLD
        {
            return ThrottleState::ClientThrottled;
        }
        ThrottleState::FullSpeed
    }

    fn stats(&mut self, now_ms: u64) -> ThrottleStats {
        let state = self.classify(now_ms);
        ThrottleStats {
            state,
            recent_wait_count: self.wait_events.len(),
            recent_throttle_count: self.server_events.len(),
            average_wait_ms: self.average_wait_ms(),
        }
    }
}

/// Classifies recent provider pressure from two evidence streams:
/// local limiter waits and server 429 responses.
///
/// A single 429 in the window wins over any amount of local waiting.
pub struct ThrottleMonitor {
    window: Mutex<Window>,
    epoch: Instant,
}

impl ThrottleMonitor {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let window_ms = window.as_millis() as u64;
        Self {
            window: Mutex::new(Window::new(window_ms)),
            epoch: Instant::now(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record a local rate-limiter wait.
    pub async fn record_wait(&self, wait: Duration) {
        let now = self.now_ms();
        #[allow(clippy::cast_possible_truncation)]
        let wait_ms = wait.as_millis() as u64;
        self.window.lock().await.record_wait(now, wait_ms);
    }

    /// Record a 429 response from the provider.
    pub async fn record_server_throttle(&self) {
        let now = self.now_ms();
        self.window.lock().await.record_server_throttle(now);
    }

    pub async fn state(&self) -> ThrottleState {
        let now = self.now_ms();
        self.window.lock().await.classify(now)
    }

    /// Purge expired events, then classify and report the window.
    pub async fn get_stats(&self) -> ThrottleStats {
        let now = self.now_ms();
        self.window.lock().await.stats(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WINDOW_MS: u64 = 60_000;

    #[test]
    fn fresh_window_is_full_speed() {
        let mut window = Window::new(WINDOW_MS);
        assert_eq!(window.classify(0), ThrottleState::FullSpeed);
    }

    #[test]
    fn single_server_throttle_flips_state() {
        let mut window = Window::new(WINDOW_MS);
        window.record_server_throttle(1_000);
        assert_eq!(window.classify(1_000), ThrottleState::ServerThrottled);
    }

    #[test]
    fn server_throttle_expires_with_the_window() {
        let mut window = Window::new(WINDOW_MS);
        window.record_server_throttle(1_000);
        assert_eq!(window.classify(30_000), ThrottleState::ServerThrottled);
        assert_eq!(window.classify(61_001), ThrottleState::FullSpeed);
    }

    #[test]
    fn frequent_long_waits_mean_client_throttled() {
        let mut window = Window::new(WINDOW_MS);
        for i in 0..6 {
            window.record_wait(i * 100, 800);
        }
        assert_eq!(window.classify(1_000), ThrottleState::ClientThrottled);
    }

    #[test]
    fn five_waits_are_not_enough() {
        let mut window = Window::new(WINDOW_MS);
        for i in 0..5 {
            window.record_wait(i * 100, 800);
        }
        assert_eq!(window.classify(1_000), ThrottleState::FullSpeed);
    }

    #[test]
    fn many_short_waits_stay_full_speed() {
        let mut window = Window::new(WINDOW_MS);
        for i in 0..20 {
            window.record_wait(i * 100, 100);
        }
        assert_eq!(window.classify(3_000), ThrottleState::FullSpeed);
    }

    #[test]
    fn server_throttle_outranks_client_waits() {
        let mut window = Window::new(WINDOW_MS);
        for i in 0..10 {
            window.record_wait(i * 100, 900);
        }
        window.record_server_throttle(1_100);
        assert_eq!(window.classify(1_200), ThrottleState::ServerThrottled);
    }

    #[test]
    fn waits_expire_and_state_recovers() {
        let mut window = Window::new(WINDOW_MS);
        for i in 0..6 {
            window.record_wait(i * 100, 800);
        }
        assert_eq!(window.classify(1_000), ThrottleState::ClientThrottled);
        assert_eq!(window.classify(62_000), ThrottleState::FullSpeed);
    }

    #[test]
    fn stats_report_window_contents() {
        let mut window = Window::new(WINDOW_MS);
        window.record_wait(0, 400);
        window.record_wait(100, 600);
        window.record_server_throttle(200);
        let stats = window.stats(300);
        assert_eq!(stats.state, ThrottleState::ServerThrottled);
        assert_eq!(stats.recent_wait_count, 2);
        assert_eq!(stats.recent_throttle_count, 1);
        assert!((stats.average_wait_ms - 500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn monitor_records_and_classifies() {
        let monitor = ThrottleMonitor::new(Duration::from_secs(60));
        assert_eq!(monitor.state().await, ThrottleState::FullSpeed);
        monitor.record_server_throttle().await;
        assert_eq!(monitor.state().await, ThrottleState::ServerThrottled);
        let stats = monitor.get_stats().await;
        assert_eq!(stats.recent_throttle_count, 1);
    }
}
