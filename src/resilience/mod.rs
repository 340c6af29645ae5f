//! 弹性模式模块：熔断器、限流器与紧急停止开关。
//!
//! # Safety Controls
//!
//! Failure isolation and request budgeting shared by every orchestrator in the
//! process.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-endpoint CLOSED / OPEN / HALF_OPEN state machine |
//! | [`rate_limiter`] | Fixed-window request budget per endpoint with burst allowance |
//! | [`kill_switch`] | Startup flag plus runtime override forcing everything off |
//! | [`SafetyControls`] | The bundle the request coordinator consults |
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use poll_sync::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("/api/sessions", config);
//!
//! if breaker.allow_request() {
//!     // Make the call...
//!     breaker.record_success();
//! }
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use poll_sync::resilience::rate_limiter::{RateLimiter, RateLimiterConfig, RequestPriority};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(
//!     RateLimiterConfig::new()
//!         .with_max_requests(10)
//!         .with_burst(5)
//!         .with_window(Duration::from_secs(60)),
//! );
//! assert!(limiter.try_acquire("/api/sessions", RequestPriority::Background).is_ok());
//! ```

pub mod circuit_breaker;
pub mod kill_switch;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use kill_switch::KillSwitch;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot, RequestPriority};

use crate::clock::{system_clock, SharedClock};
use crate::config::SyncConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Process-wide safety state: one breaker per endpoint, one limiter, one kill switch.
pub struct SafetyControls {
    breaker_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiter: RateLimiter,
    kill_switch: KillSwitch,
    clock: SharedClock,
}

impl SafetyControls {
    pub fn new(
        breaker_config: CircuitBreakerConfig,
        limiter_config: RateLimiterConfig,
        kill_switch: KillSwitch,
    ) -> Self {
        Self::with_clock(breaker_config, limiter_config, kill_switch, system_clock())
    }

    pub fn with_clock(
        breaker_config: CircuitBreakerConfig,
        limiter_config: RateLimiterConfig,
        kill_switch: KillSwitch,
        clock: SharedClock,
    ) -> Self {
        Self {
            breaker_config,
            breakers: RwLock::new(HashMap::new()),
            limiter: RateLimiter::with_clock(limiter_config, clock.clone()),
            kill_switch,
            clock,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            CircuitBreakerConfig::from_settings(&config.circuit_breaker),
            RateLimiterConfig::from_settings(&config.rate_limit),
            KillSwitch::new(config.kill_switch),
        )
    }

    /// Breaker for `endpoint`, created on first use.
    pub fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .ok()
            .and_then(|m| m.get(endpoint).cloned())
        {
            return b;
        }
        let mut map = match self.breakers.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    endpoint,
                    self.breaker_config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Snapshot of the breaker for `endpoint` without creating one.
    pub fn breaker_snapshot(&self, endpoint: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers
            .read()
            .ok()
            .and_then(|m| m.get(endpoint).map(|b| b.snapshot()))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// Periodically evict stale rate-limit windows until `cancel` fires.
    pub fn spawn_limiter_sweeper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controls = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        controls.limiter.sweep();
                    }
                }
            }
        })
    }

    /// Close every breaker and clear every rate-limit window.
    pub fn reset(&self) {
        if let Ok(map) = self.breakers.read() {
            for b in map.values() {
                b.reset();
            }
        }
        self.limiter.reset();
    }
}

impl Default for SafetyControls {
    fn default() -> Self {
        Self::new(
            CircuitBreakerConfig::default(),
            RateLimiterConfig::default(),
            KillSwitch::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakers_are_per_endpoint() {
        let controls = SafetyControls::new(
            CircuitBreakerConfig::new().with_failure_threshold(1),
            RateLimiterConfig::default(),
            KillSwitch::default(),
        );
        controls.breaker_for("/a").on_failure();
        assert!(controls.breaker_for("/a").is_open());
        assert!(!controls.breaker_for("/b").is_open());
        assert!(Arc::ptr_eq(&controls.breaker_for("/a"), &controls.breaker_for("/a")));
    }

    #[test]
    fn test_reset_closes_breakers() {
        let controls = SafetyControls::new(
            CircuitBreakerConfig::new().with_failure_threshold(1),
            RateLimiterConfig::default(),
            KillSwitch::default(),
        );
        controls.breaker_for("/a").on_failure();
        controls.reset();
        assert_eq!(controls.breaker_for("/a").state(), CircuitState::Closed);
        assert!(controls.breaker_snapshot("/missing").is_none());
    }
}
