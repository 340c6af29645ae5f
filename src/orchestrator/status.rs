use crate::connection::{ConnectionMode, ConnectionStats};
use crate::coordinator::CoordinatorStats;
use crate::optimization::OptimizerStats;
use crate::processing::ProcessingStats;
use crate::registry::RegistrationToken;
use crate::resilience::{CircuitBreakerSnapshot, RateLimiterSnapshot};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Render efficiency above which the system counts as optimal.
pub const OPTIMAL_EFFICIENCY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl PerformanceRating {
    /// Grade from connection success rate and render efficiency.
    pub fn grade(healthy: bool, success_rate: f64, render_efficiency: f64) -> Self {
        if healthy && success_rate >= 0.95 && render_efficiency > OPTIMAL_EFFICIENCY {
            PerformanceRating::Excellent
        } else if healthy && success_rate >= 0.8 {
            PerformanceRating::Good
        } else if success_rate >= 0.5 {
            PerformanceRating::Fair
        } else {
            PerformanceRating::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub is_healthy: bool,
    pub is_optimal: bool,
    pub connection_status: ConnectionMode,
    pub performance_rating: PerformanceRating,
}

impl SystemStatus {
    pub(crate) fn derive(
        mode: ConnectionMode,
        connection: &ConnectionStats,
        optimization: &OptimizerStats,
    ) -> Self {
        let is_healthy = matches!(mode, ConnectionMode::Live | ConnectionMode::Idle);
        SystemStatus {
            is_healthy,
            is_optimal: optimization.render_efficiency > OPTIMAL_EFFICIENCY,
            connection_status: mode,
            performance_rating: PerformanceRating::grade(
                is_healthy,
                connection.success_rate,
                optimization.render_efficiency,
            ),
        }
    }
}

/// Everything a display layer needs in one read.
#[derive(Debug, Clone)]
pub struct SyncView {
    pub data: Option<Arc<Value>>,
    pub is_connected: bool,
    pub connection_mode: ConnectionMode,
    pub error: Option<String>,
    pub last_update: Option<Instant>,
    pub system_status: SystemStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub endpoint: String,
    pub label: String,
    pub environment: String,
    pub interval_ms: u64,
    pub running: bool,
    pub token: Option<RegistrationToken>,
    pub ticks: u64,
    pub connection: ConnectionStats,
    pub processing: ProcessingStats,
    pub optimization: OptimizerStats,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    pub rate_limit: RateLimiterSnapshot,
    pub coordinator: CoordinatorStats,
    pub status: SystemStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_grades() {
        assert_eq!(PerformanceRating::grade(true, 1.0, 0.9), PerformanceRating::Excellent);
        assert_eq!(PerformanceRating::grade(true, 1.0, 0.5), PerformanceRating::Good);
        assert_eq!(PerformanceRating::grade(false, 0.6, 0.9), PerformanceRating::Fair);
        assert_eq!(PerformanceRating::grade(false, 0.2, 0.9), PerformanceRating::Poor);
    }

    #[test]
    fn test_optimal_threshold_is_strict() {
        let opt = OptimizerStats {
            render_efficiency: 0.8,
            ..Default::default()
        };
        let s = SystemStatus::derive(ConnectionMode::Live, &ConnectionStats::default(), &opt);
        assert!(!s.is_optimal);
        assert!(s.is_healthy);
    }
}
