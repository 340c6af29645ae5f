use super::SyncOrchestrator;
use crate::clock::{system_clock, SharedClock};
use crate::connection::{ConnectionController, TickDrivenPoller};
use crate::coordinator::RequestCoordinator;
use crate::optimization::{EssentialExtractor, IdentityExtractor, OptimizerConfig, StateOptimizer};
use crate::processing::{DataProcessor, PayloadTransform, PayloadValidator};
use crate::registry::SyncRegistry;
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`SyncOrchestrator`].
///
/// Registry and coordinator are process-wide services and must be supplied;
/// everything else has a default.
pub struct SyncOrchestratorBuilder {
    endpoint: String,
    label: Option<String>,
    metadata: Value,
    registry: Option<Arc<SyncRegistry>>,
    coordinator: Option<Arc<RequestCoordinator>>,
    interval: Option<Duration>,
    validator: Option<Arc<dyn PayloadValidator>>,
    transform: Option<Arc<dyn PayloadTransform>>,
    extractor: Arc<dyn EssentialExtractor>,
    optimizer: OptimizerConfig,
    clock: SharedClock,
}

impl SyncOrchestratorBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            label: None,
            metadata: Value::Null,
            registry: None,
            coordinator: None,
            interval: None,
            validator: None,
            transform: None,
            extractor: Arc::new(IdentityExtractor),
            optimizer: OptimizerConfig::default(),
            clock: system_clock(),
        }
    }

    /// Human-readable owner name, shown when another admission is rejected.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SyncRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<RequestCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Override the poll interval from the environment policy.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EssentialExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_optimizer_config(mut self, config: OptimizerConfig) -> Self {
        self.optimizer = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Arc<SyncOrchestrator>> {
        let missing = |what: &str| {
            Error::configuration_with_context(
                format!("{} is required", what),
                ErrorContext::new()
                    .with_field_path(what)
                    .with_source("orchestrator_builder")
                    .with_endpoint(self.endpoint.clone()),
            )
        };
        let registry = self.registry.clone().ok_or_else(|| missing("registry"))?;
        let coordinator = self
            .coordinator
            .clone()
            .ok_or_else(|| missing("coordinator"))?;

        let interval = self
            .interval
            .unwrap_or_else(|| coordinator.policy().interval_for(&self.endpoint));
        if interval.is_zero() {
            return Err(Error::configuration_with_context(
                "interval must be greater than zero",
                ErrorContext::new()
                    .with_field_path("interval")
                    .with_source("orchestrator_builder")
                    .with_endpoint(self.endpoint.clone()),
            ));
        }

        let stale_after = registry.config().stale_after;
        if interval > stale_after {
            return Err(Error::configuration_with_context(
                format!(
                    "interval of {} ms exceeds the registry's stale_after of {} ms",
                    interval.as_millis(),
                    stale_after.as_millis()
                ),
                ErrorContext::new()
                    .with_field_path("interval")
                    .with_source("orchestrator_builder")
                    .with_endpoint(self.endpoint.clone()),
            ));
        }

        // validates the endpoint
        let controller = Arc::new(ConnectionController::with_clock(
            self.endpoint.clone(),
            coordinator,
            self.clock.clone(),
        )?);

        let mut processor = DataProcessor::new();
        if let Some(v) = self.validator {
            processor = processor.with_validator(v);
        }
        if let Some(t) = self.transform {
            processor = processor.with_transform(t);
        }

        let label = self.label.unwrap_or_else(|| self.endpoint.clone());
        Ok(Arc::new(SyncOrchestrator::assemble(
            self.endpoint,
            label,
            self.metadata,
            interval,
            registry,
            TickDrivenPoller::new(controller),
            processor,
            StateOptimizer::with_extractor(self.optimizer, self.extractor),
            self.clock,
        )))
    }
}
