use super::SyncOrchestratorBuilder;
use crate::clock::{system_clock, SharedClock};
use crate::config::SyncConfig;
use crate::coordinator::RequestCoordinator;
use crate::optimization::OptimizerConfig;
use crate::policy::EnvironmentPolicy;
use crate::registry::{RegistryConfig, SyncRegistry};
use crate::resilience::{CircuitBreakerConfig, KillSwitch, RateLimiterConfig, SafetyControls};
use crate::transport::ResourceFetcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The process-wide services, wired once from a [`SyncConfig`].
///
/// Holds the registry and the request coordinator (which owns the safety
/// controls). Orchestrators built through [`SyncRuntime::orchestrator`] share
/// them.
#[derive(Clone)]
pub struct SyncRuntime {
    config: Arc<SyncConfig>,
    registry: Arc<SyncRegistry>,
    coordinator: Arc<RequestCoordinator>,
    clock: SharedClock,
}

impl SyncRuntime {
    pub fn from_config(config: SyncConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self::with_clock(config, fetcher, system_clock())
    }

    pub fn with_clock(config: SyncConfig, fetcher: Arc<dyn ResourceFetcher>, clock: SharedClock) -> Self {
        let controls = Arc::new(SafetyControls::with_clock(
            CircuitBreakerConfig::from_settings(&config.circuit_breaker),
            RateLimiterConfig::from_settings(&config.rate_limit),
            KillSwitch::new(config.kill_switch),
            clock.clone(),
        ));
        let policy = EnvironmentPolicy::from_config(&config);
        let registry = Arc::new(SyncRegistry::with_clock(
            RegistryConfig::from_settings(&config.registry),
            clock.clone(),
        ));
        info!(
            environment = %config.environment,
            kill_switch = config.kill_switch,
            "sync runtime initialized"
        );
        Self {
            coordinator: Arc::new(RequestCoordinator::new(fetcher, controls, policy)),
            registry,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SyncRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    pub fn controls(&self) -> &Arc<SafetyControls> {
        self.coordinator.controls()
    }

    /// Builder pre-wired with this runtime's services and debug settings.
    pub fn orchestrator(&self, endpoint: impl Into<String>) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder::new(endpoint)
            .with_registry(Arc::clone(&self.registry))
            .with_coordinator(Arc::clone(&self.coordinator))
            .with_optimizer_config(
                OptimizerConfig::default().with_show_hash_changes(self.config.debug.show_hash_changes),
            )
            .with_clock(self.clock.clone())
    }

    /// Start the registry staleness sweep and the rate-limit window sweep.
    /// Both stop when `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) {
        let _ = self.registry.spawn_sweeper(cancel.child_token());
        let _ = self.controls().spawn_limiter_sweeper(
            Duration::from_millis(self.config.rate_limit.sweep_interval_ms.max(1)),
            cancel.child_token(),
        );
    }

    /// Reset the registry and every breaker and rate-limit window.
    pub fn reset(&self) {
        self.registry.reset();
        self.controls().reset();
    }
}
