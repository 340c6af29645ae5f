use crate::clock::{system_clock, SharedClock};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    /// How many times the breaker has tripped open.
    pub trips: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct State {
    circuit: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trips: u64,
}

/// Per-endpoint circuit breaker.
///
/// - CLOSED: calls pass, consecutive failures are counted
/// - OPEN: calls short-circuit until the recovery timeout elapses
/// - HALF_OPEN: exactly one trial call is admitted; its outcome closes or
///   re-opens the circuit (re-opening restarts the timeout)
pub struct CircuitBreaker {
    endpoint: String,
    cfg: CircuitBreakerConfig,
    clock: SharedClock,
    state: std::sync::Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(endpoint, cfg, system_clock())
    }

    pub fn with_clock(
        endpoint: impl Into<String>,
        cfg: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            cfg,
            clock,
            state: std::sync::Mutex::new(State {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                trips: 0,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn allow(&self) -> Result<()> {
        let mut st = self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "CircuitBreaker poisoned",
                ErrorContext::new()
                    .with_source("circuit_breaker")
                    .with_endpoint(self.endpoint.clone()),
            )
        })?;
        match st.circuit {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = self.clock.now();
                let opened_at = st.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cfg.cooldown {
                    // recovery timeout elapsed: this caller is the trial
                    st.circuit = CircuitState::HalfOpen;
                    st.trial_in_flight = true;
                    info!(endpoint = %self.endpoint, "circuit half-open, admitting trial request");
                    Ok(())
                } else {
                    Err(self.open_error(self.cfg.cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    st.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn open_error(&self, remaining: Duration) -> Error {
        Error::CircuitOpen {
            endpoint: self.endpoint.clone(),
            retry_after_ms: remaining.as_millis() as u64,
        }
    }

    pub fn on_success(&self) {
        if let Ok(mut st) = self.state.lock() {
            match st.circuit {
                CircuitState::Closed => st.consecutive_failures = 0,
                CircuitState::HalfOpen => {
                    st.circuit = CircuitState::Closed;
                    st.consecutive_failures = 0;
                    st.opened_at = None;
                    st.trial_in_flight = false;
                    info!(endpoint = %self.endpoint, "circuit closed after successful trial");
                }
                // late completion of a call admitted before the circuit opened
                CircuitState::Open => {}
            }
        }
    }

    pub fn on_failure(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            match st.circuit {
                CircuitState::Closed => {
                    if st.consecutive_failures >= self.cfg.failure_threshold {
                        st.circuit = CircuitState::Open;
                        st.opened_at = Some(self.clock.now());
                        st.trips += 1;
                        warn!(
                            endpoint = %self.endpoint,
                            consecutive_failures = st.consecutive_failures,
                            cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                            "circuit opened"
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    st.circuit = CircuitState::Open;
                    st.opened_at = Some(self.clock.now());
                    st.trial_in_flight = false;
                    st.trips += 1;
                    warn!(endpoint = %self.endpoint, "trial request failed, circuit re-opened");
                }
                CircuitState::Open => {}
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .map(|st| st.circuit)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn reset(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.circuit = CircuitState::Closed;
            st.consecutive_failures = 0;
            st.opened_at = None;
            st.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        if let Ok(st) = self.state.lock() {
            let open_remaining_ms = match (st.circuit, st.opened_at) {
                (CircuitState::Open, Some(at)) => {
                    let elapsed = now.saturating_duration_since(at);
                    self.cfg
                        .cooldown
                        .checked_sub(elapsed)
                        .filter(|d| !d.is_zero())
                        .map(|d| d.as_millis() as u64)
                }
                _ => None,
            };
            CircuitBreakerSnapshot {
                state: st.circuit,
                failure_threshold: self.cfg.failure_threshold,
                cooldown_ms: self.cfg.cooldown.as_millis() as u64,
                consecutive_failures: st.consecutive_failures,
                open_remaining_ms,
                trips: st.trips,
            }
        } else {
            CircuitBreakerSnapshot {
                state: CircuitState::Closed,
                failure_threshold: self.cfg.failure_threshold,
                cooldown_ms: self.cfg.cooldown.as_millis() as u64,
                consecutive_failures: 0,
                open_remaining_ms: None,
                trips: 0,
            }
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Alias for with_cooldown for API consistency
    pub fn with_reset_timeout(self, timeout: Duration) -> Self {
        self.with_cooldown(timeout)
    }

    pub fn from_settings(s: &crate::config::BreakerSettings) -> Self {
        Self::new()
            .with_failure_threshold(s.failure_threshold)
            .with_cooldown(Duration::from_millis(s.recovery_timeout_ms))
    }
}

impl CircuitBreaker {
    /// Check if a request is allowed (alias for allow)
    pub fn allow_request(&self) -> bool {
        self.allow().is_ok()
    }

    /// Record a success (alias for on_success)
    pub fn record_success(&self) {
        self.on_success();
    }

    /// Record a failure (alias for on_failure)
    pub fn record_failure(&self) {
        self.on_failure();
    }
}
