use crate::clock::{system_clock, SharedClock};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Who is asking. Interactive requests (an explicit user refresh) may dip
/// into the burst allowance once the regular window budget is spent;
/// background poll cycles never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestPriority {
    #[default]
    Background,
    Interactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub max_requests: u32,
    pub burst: u32,
    pub window_ms: u64,
    pub used: u32,
    pub burst_used: u32,
    pub remaining: u32,
    /// Time until the current window rolls over, if a window is active.
    pub reset_in_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub burst: u32,
    pub window: Duration,
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            max_requests: 60,
            burst: 5,
            window: Duration::from_secs(60),
        }
    }

    pub fn with_max_requests(mut self, n: u32) -> Self {
        self.max_requests = n;
        self
    }

    pub fn with_burst(mut self, n: u32) -> Self {
        self.burst = n;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn from_settings(s: &crate::config::RateLimitSettings) -> Self {
        Self::new()
            .with_max_requests(s.max_requests)
            .with_burst(s.burst)
            .with_window(Duration::from_millis(s.window_ms))
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
    burst_used: u32,
}

/// Fixed-window request budget, keyed by endpoint.
///
/// All bookkeeping for one decision happens under a single lock, so concurrent
/// callers racing on the same endpoint see a consistent count.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    clock: SharedClock,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self::with_clock(cfg, system_clock())
    }

    pub fn with_clock(cfg: RateLimiterConfig, clock: SharedClock) -> Self {
        Self {
            cfg,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    /// Take one request from `endpoint`'s budget or fail with a retry hint.
    pub fn try_acquire(&self, endpoint: &str, priority: RequestPriority) -> Result<()> {
        let now = self.clock.now();
        let mut windows = self.windows.lock().map_err(|_| {
            Error::runtime_with_context(
                "RateLimiter poisoned",
                crate::ErrorContext::new().with_source("rate_limiter"),
            )
        })?;
        let w = windows.entry(endpoint.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
            burst_used: 0,
        });

        let elapsed = now.saturating_duration_since(w.started_at);
        if elapsed >= self.cfg.window {
            w.started_at = now;
            w.count = 0;
            w.burst_used = 0;
        }

        if w.count < self.cfg.max_requests {
            w.count += 1;
            return Ok(());
        }
        if priority == RequestPriority::Interactive && w.burst_used < self.cfg.burst {
            w.burst_used += 1;
            debug!(endpoint, burst_used = w.burst_used, "rate limit burst allowance used");
            return Ok(());
        }

        let remaining = self
            .cfg
            .window
            .saturating_sub(now.saturating_duration_since(w.started_at));
        warn!(
            endpoint,
            retry_after_ms = remaining.as_millis() as u64,
            "rate limit exceeded"
        );
        Err(Error::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after_ms: remaining.as_millis() as u64,
        })
    }

    pub fn snapshot(&self, endpoint: &str) -> RateLimiterSnapshot {
        let now = self.clock.now();
        let (used, burst_used, reset_in_ms) = self
            .windows
            .lock()
            .ok()
            .and_then(|windows| {
                windows.get(endpoint).and_then(|w| {
                    let elapsed = now.saturating_duration_since(w.started_at);
                    if elapsed >= self.cfg.window {
                        None
                    } else {
                        let left = self.cfg.window - elapsed;
                        Some((w.count, w.burst_used, Some(left.as_millis() as u64)))
                    }
                })
            })
            .unwrap_or((0, 0, None));

        RateLimiterSnapshot {
            max_requests: self.cfg.max_requests,
            burst: self.cfg.burst,
            window_ms: self.cfg.window.as_millis() as u64,
            used,
            burst_used,
            remaining: self.cfg.max_requests.saturating_sub(used),
            reset_in_ms,
        }
    }

    /// Evict endpoints whose window expired more than one window ago.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let horizon = self.cfg.window.saturating_mul(2);
        let Ok(mut windows) = self.windows.lock() else {
            return 0;
        };
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.started_at) < horizon);
        let evicted = before - windows.len();
        if evicted > 0 {
            debug!(evicted, "rate limiter swept stale windows");
        }
        evicted
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn reset(&self) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn limiter(max: u32, burst: u32, window: Duration) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let cfg = RateLimiterConfig::new()
            .with_max_requests(max)
            .with_burst(burst)
            .with_window(window);
        (RateLimiter::with_clock(cfg, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_rate_limiter_config_builder() {
        let config = RateLimiterConfig::new()
            .with_max_requests(100)
            .with_burst(7)
            .with_window(Duration::from_secs(10));
        assert_eq!(config.max_requests, 100);
        assert_eq!(config.burst, 7);
        assert_eq!(config.window, Duration::from_secs(10));
    }

    #[test]
    fn test_eleventh_request_rejected_with_hint() {
        let (rl, clock) = limiter(10, 5, Duration::from_secs(60));
        for _ in 0..10 {
            assert!(rl.try_acquire("/api/sessions", RequestPriority::Background).is_ok());
        }
        clock.advance(Duration::from_secs(20));
        match rl.try_acquire("/api/sessions", RequestPriority::Background) {
            Err(Error::RateLimited { retry_after_ms, .. }) => {
                assert!(retry_after_ms <= 40_000);
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_window_expiry_resets_counter() {
        let (rl, clock) = limiter(10, 5, Duration::from_secs(60));
        for _ in 0..10 {
            rl.try_acquire("/api/sessions", RequestPriority::Background).unwrap();
        }
        assert_eq!(rl.snapshot("/api/sessions").used, 10);

        clock.advance(Duration::from_secs(60));
        assert_eq!(rl.snapshot("/api/sessions").used, 0);
        assert!(rl.try_acquire("/api/sessions", RequestPriority::Background).is_ok());
        assert_eq!(rl.snapshot("/api/sessions").used, 1);
    }

    #[test]
    fn test_interactive_requests_use_burst() {
        let (rl, _) = limiter(2, 1, Duration::from_secs(60));
        rl.try_acquire("/api/boards", RequestPriority::Background).unwrap();
        rl.try_acquire("/api/boards", RequestPriority::Background).unwrap();
        assert!(rl.try_acquire("/api/boards", RequestPriority::Background).is_err());

        assert!(rl.try_acquire("/api/boards", RequestPriority::Interactive).is_ok());
        assert!(rl.try_acquire("/api/boards", RequestPriority::Interactive).is_err());
        assert_eq!(rl.snapshot("/api/boards").burst_used, 1);
    }

    #[test]
    fn test_endpoints_have_independent_budgets() {
        let (rl, _) = limiter(1, 0, Duration::from_secs(60));
        rl.try_acquire("/a", RequestPriority::Background).unwrap();
        assert!(rl.try_acquire("/a", RequestPriority::Background).is_err());
        assert!(rl.try_acquire("/b", RequestPriority::Background).is_ok());
    }

    #[test]
    fn test_sweep_evicts_long_expired_windows() {
        let (rl, clock) = limiter(5, 0, Duration::from_secs(10));
        rl.try_acquire("/a", RequestPriority::Background).unwrap();
        clock.advance(Duration::from_secs(15));
        rl.try_acquire("/b", RequestPriority::Background).unwrap();
        assert_eq!(rl.sweep(), 0);

        clock.advance(Duration::from_secs(6));
        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.tracked_endpoints(), 1);
    }
}
