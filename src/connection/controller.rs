use super::stats::{ConnectionMode, ConnectionStats};
use crate::clock::{system_clock, SharedClock};
use crate::coordinator::RequestCoordinator;
use crate::resilience::RequestPriority;
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct ConnectionState {
    stats: ConnectionStats,
    mode: ConnectionMode,
    last_error: Option<Error>,
    started_at: Instant,
}

/// Owns one endpoint's fetch cycle and its reliability statistics.
///
/// The controller never schedules anything itself; a [`Poller`](super::Poller)
/// decides when [`fetch_data`](Self::fetch_data) runs.
pub struct ConnectionController {
    endpoint: String,
    coordinator: Arc<RequestCoordinator>,
    clock: SharedClock,
    enabled: AtomicBool,
    epoch: AtomicU64,
    state: Mutex<ConnectionState>,
}

impl ConnectionController {
    pub fn new(endpoint: impl Into<String>, coordinator: Arc<RequestCoordinator>) -> Result<Self> {
        Self::with_clock(endpoint, coordinator, system_clock())
    }

    pub fn with_clock(
        endpoint: impl Into<String>,
        coordinator: Arc<RequestCoordinator>,
        clock: SharedClock,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(Error::configuration_with_context(
                "endpoint must not be empty",
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_source("connection_controller"),
            ));
        }
        let now = clock.now();
        Ok(Self {
            endpoint,
            coordinator,
            clock,
            enabled: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            state: Mutex::new(ConnectionState {
                stats: ConnectionStats::default(),
                mode: ConnectionMode::Idle,
                last_error: None,
                started_at: now,
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Invalidate every fetch currently in flight. Returns the new epoch.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn start(&self) {
        self.set_enabled(true);
        self.bump_epoch();
        self.lock_state().started_at = self.clock.now();
        debug!(endpoint = %self.endpoint, "connection started");
    }

    pub(crate) fn stop(&self) {
        self.bump_epoch();
        let mut st = self.lock_state();
        st.mode = ConnectionMode::Idle;
        debug!(endpoint = %self.endpoint, "connection stopped");
    }

    /// Background fetch. Failures are recorded, never raised.
    pub async fn fetch_data(&self) -> Option<Arc<Value>> {
        self.fetch_with(RequestPriority::Background).await.ok()
    }

    /// Interactive fetch for explicit refreshes; failures propagate.
    pub async fn fetch_checked(&self) -> Result<Arc<Value>> {
        self.fetch_with(RequestPriority::Interactive).await
    }

    async fn fetch_with(&self, priority: RequestPriority) -> Result<Arc<Value>> {
        if !self.is_enabled() {
            return Err(Error::Disabled);
        }

        let epoch = self.epoch();
        self.lock_state().stats.record_attempt(self.clock.now());

        let result = self.coordinator.execute(&self.endpoint, priority).await;

        if self.epoch() != epoch {
            debug!(endpoint = %self.endpoint, "discarding result from a previous connection epoch");
            return Err(Error::runtime_with_context(
                "result discarded after connection restart",
                ErrorContext::new()
                    .with_source("connection_controller")
                    .with_endpoint(self.endpoint.clone()),
            ));
        }

        let now = self.clock.now();
        let mut st = self.lock_state();
        match result {
            Ok(data) => {
                st.stats.record_success(now);
                st.mode = ConnectionMode::Live;
                st.last_error = None;
                Ok(data)
            }
            Err(e) => {
                st.stats.record_error(now, e.to_string());
                st.mode = match &e {
                    Error::CircuitOpen { .. } => ConnectionMode::CircuitOpen,
                    Error::Disabled => ConnectionMode::Disabled,
                    _ => ConnectionMode::Degraded,
                };
                st.last_error = Some(e.clone());
                if e.is_short_circuit() {
                    debug!(endpoint = %self.endpoint, error = %e, "fetch short-circuited");
                } else {
                    warn!(endpoint = %self.endpoint, error = %e, errors = st.stats.errors, "fetch failed");
                }
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock_state().stats.clone()
    }

    pub fn mode(&self) -> ConnectionMode {
        if !self.is_enabled() || self.coordinator.controls().kill_switch().is_engaged() {
            return ConnectionMode::Disabled;
        }
        self.lock_state().mode
    }

    pub fn is_connected(&self) -> bool {
        self.mode() == ConnectionMode::Live
    }

    pub fn last_error(&self) -> Option<Error> {
        self.lock_state().last_error.clone()
    }

    /// `false` (with a warning) when the last success, or the start if there
    /// was none, is older than three intervals.
    pub fn check_health(&self, interval: Duration) -> bool {
        let now = self.clock.now();
        let st = self.lock_state();
        let since = st
            .stats
            .since_last_success(now)
            .unwrap_or_else(|| now.saturating_duration_since(st.started_at));
        let limit = interval.saturating_mul(3);
        if since > limit {
            warn!(
                endpoint = %self.endpoint,
                since_last_success_ms = since.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                "no successful fetch within three poll intervals"
            );
            return false;
        }
        true
    }

    /// Clear statistics and drop any in-flight result.
    pub fn reset(&self) {
        self.bump_epoch();
        let now = self.clock.now();
        let mut st = self.lock_state();
        st.stats = ConnectionStats::default();
        st.mode = ConnectionMode::Idle;
        st.last_error = None;
        st.started_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::{Environment, EnvironmentPolicy};
    use crate::resilience::{CircuitBreakerConfig, KillSwitch, RateLimiterConfig, SafetyControls};
    use crate::transport::FnFetcher;
    use serde_json::json;

    fn coordinator(fail: bool) -> Arc<RequestCoordinator> {
        let fetcher = FnFetcher::shared(move |endpoint| async move {
            if fail {
                Err(Error::transport_with_context(
                    "connection refused",
                    ErrorContext::new().with_endpoint(endpoint),
                ))
            } else {
                Ok(json!({"items": []}))
            }
        });
        Arc::new(RequestCoordinator::new(
            fetcher,
            Arc::new(SafetyControls::new(
                CircuitBreakerConfig::new().with_failure_threshold(2),
                RateLimiterConfig::default(),
                KillSwitch::default(),
            )),
            EnvironmentPolicy::for_environment(Environment::Test),
        ))
    }

    #[test]
    fn test_empty_endpoint_is_configuration_error() {
        let err = ConnectionController::new("  ", coordinator(false)).err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_success_marks_live() {
        let c = ConnectionController::new("/api/sessions", coordinator(false)).unwrap();
        assert_eq!(c.mode(), ConnectionMode::Idle);
        assert!(c.fetch_data().await.is_some());
        assert!(c.is_connected());
        let s = c.stats();
        assert_eq!((s.attempts, s.successes, s.errors), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_failures_never_raise_and_open_circuit() {
        let c = ConnectionController::new("/api/sessions", coordinator(true)).unwrap();
        assert!(c.fetch_data().await.is_none());
        assert_eq!(c.mode(), ConnectionMode::Degraded);
        assert!(c.fetch_data().await.is_none());
        assert!(c.fetch_data().await.is_none());
        assert_eq!(c.mode(), ConnectionMode::CircuitOpen);

        let s = c.stats();
        assert_eq!(s.attempts, 3);
        assert_eq!(s.errors, 3);
        assert!(s.last_error.is_some());
        assert_eq!(s.success_rate, 0.0);
        assert!(matches!(c.last_error(), Some(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_checked_fetch_propagates() {
        let c = ConnectionController::new("/api/boards", coordinator(true)).unwrap();
        assert!(matches!(c.fetch_checked().await, Err(Error::Transport { .. })));
    }

    #[tokio::test]
    async fn test_disabled_controller_makes_no_attempt() {
        let c = ConnectionController::new("/api/boards", coordinator(false)).unwrap();
        c.set_enabled(false);
        assert!(c.fetch_data().await.is_none());
        assert_eq!(c.stats().attempts, 0);
        assert_eq!(c.mode(), ConnectionMode::Disabled);
    }

    #[test]
    fn test_health_check_uses_three_intervals() {
        let clock = ManualClock::new();
        let c = ConnectionController::with_clock("/api/sessions", coordinator(false), Arc::new(clock.clone()))
            .unwrap();
        clock.advance(Duration::from_secs(3));
        assert!(c.check_health(Duration::from_secs(1)));
        clock.advance(Duration::from_millis(1));
        assert!(!c.check_health(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_reset_clears_stats_and_bumps_epoch() {
        let c = ConnectionController::new("/api/sessions", coordinator(false)).unwrap();
        c.fetch_data().await;
        let before = c.epoch();
        c.reset();
        assert!(c.epoch() > before);
        assert_eq!(c.stats().attempts, 0);
        assert_eq!(c.mode(), ConnectionMode::Idle);
    }
}
