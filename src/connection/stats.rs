use serde::Serialize;
use std::time::{Duration, Instant};

/// How the connection currently looks to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Not started, stopped, or no attempt yet.
    #[default]
    Idle,
    Live,
    /// The last attempt failed; the next tick retries.
    Degraded,
    /// The breaker short-circuited the last attempt.
    CircuitOpen,
    /// Kill switch engaged or the controller is disabled.
    Disabled,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Idle => "idle",
            ConnectionMode::Live => "live",
            ConnectionMode::Degraded => "degraded",
            ConnectionMode::CircuitOpen => "circuit_open",
            ConnectionMode::Disabled => "disabled",
        }
    }
}

/// Read-only copy of a controller's reliability counters.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub successes: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_attempt_at: Option<Instant>,
    #[serde(skip)]
    pub last_success_at: Option<Instant>,
    #[serde(skip)]
    pub last_error_at: Option<Instant>,
    /// successes / (successes + errors); 1.0 before any completed attempt.
    pub success_rate: f64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            errors: 0,
            last_error: None,
            last_attempt_at: None,
            last_success_at: None,
            last_error_at: None,
            success_rate: 1.0,
        }
    }
}

impl ConnectionStats {
    pub(crate) fn record_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        self.successes += 1;
        self.last_success_at = Some(now);
        self.last_error = None;
        self.refresh_rate();
    }

    pub(crate) fn record_error(&mut self, now: Instant, message: String) {
        self.errors += 1;
        self.last_error_at = Some(now);
        self.last_error = Some(message);
        self.refresh_rate();
    }

    fn refresh_rate(&mut self) {
        let done = self.successes + self.errors;
        self.success_rate = if done == 0 {
            1.0
        } else {
            self.successes as f64 / done as f64
        };
    }

    pub fn since_last_success(&self, now: Instant) -> Option<Duration> {
        self.last_success_at
            .map(|at| now.saturating_duration_since(at))
    }
}
