//! 集成编排器：在唯一的外部定时器下组合连接、处理与优化三层。
//!
//! # Integration Orchestrator
//!
//! One [`SyncOrchestrator`] per endpoint, admitted through the
//! [`SyncRegistry`]. It drives a [`TickDrivenPoller`] from exactly one tokio
//! interval, so the connection layer never runs a timer of its own.
//!
//! Each tick:
//!
//! ```text
//! fetch (coordinator) → validate/transform (processor) → hash-compare (optimizer) → publish
//! ```
//!
//! Ticks are sequential. Timer-driven failures are recorded and surfaced via
//! [`SyncOrchestrator::view`], never raised. [`SyncOrchestrator::refresh`] runs
//! the same pipeline on demand and propagates errors; it may overlap a tick,
//! in which case whichever publishes last wins.
//!
//! Every tick confirms its registration is still live. A registration reaped
//! by [`SyncRegistry::sweep_stale`] stops the timer, so a reaped synchronizer
//! never polls alongside the one admitted after it. `refresh` works without a
//! registration (one-off reads) but is refused while a different
//! synchronizer owns the endpoint.
//!
//! ```rust,no_run
//! use poll_sync::orchestrator::SyncRuntime;
//! use poll_sync::config::SyncConfig;
//! use poll_sync::transport::HttpFetcher;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> poll_sync::Result<()> {
//!     let runtime = SyncRuntime::from_config(
//!         SyncConfig::from_env(),
//!         Arc::new(HttpFetcher::new("http://localhost:8080")?),
//!     );
//!     let sessions = runtime.orchestrator("/api/sessions").with_label("SessionList").build()?;
//!     let mut updates = sessions.subscribe();
//!     if sessions.start().is_some() {
//!         while updates.changed().await.is_ok() {
//!             println!("{:?}", *updates.borrow());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod builder;
mod runtime;
mod status;

pub use builder::SyncOrchestratorBuilder;
pub use runtime::SyncRuntime;
pub use status::{PerformanceRating, SyncView, SystemStats, SystemStatus, OPTIMAL_EFFICIENCY};

use crate::clock::SharedClock;
use crate::connection::{ConnectionController, Poller, TickDrivenPoller};
use crate::optimization::{StableData, StateOptimizer};
use crate::processing::DataProcessor;
use crate::registry::{ActivityKind, RegistrationToken, SyncRegistry};
use crate::{Error, ErrorContext, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one timer-driven cycle.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Content changed; a new reference was published.
    Published(StableData),
    /// Content unchanged; the previous reference stands.
    Unchanged(StableData),
    /// Cycle skipped without a fetch error (validation, kill switch, restart).
    Skipped(String),
    /// Fetch or transform failed.
    Failed(Error),
    /// Not registered; nothing was attempted.
    Inactive,
}

impl TickOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, TickOutcome::Published(_))
    }
}

#[derive(Default)]
struct Lifecycle {
    token: Option<RegistrationToken>,
    timer: Option<CancellationToken>,
    last_update: Option<Instant>,
    last_error: Option<String>,
}

pub struct SyncOrchestrator {
    endpoint: String,
    label: String,
    metadata: Value,
    interval: Duration,
    registry: Arc<SyncRegistry>,
    poller: TickDrivenPoller,
    processor: DataProcessor,
    optimizer: StateOptimizer,
    clock: SharedClock,
    lifecycle: Mutex<Lifecycle>,
    // keeps ticks sequential; refresh deliberately does not take it
    tick_gate: tokio::sync::Mutex<()>,
    // compare-and-store in the optimizer and the watch send happen as one step
    publish_lock: Mutex<()>,
    ticks: AtomicU64,
    tx: watch::Sender<Option<Arc<Value>>>,
}

impl SyncOrchestrator {
    pub fn builder(endpoint: impl Into<String>) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder::new(endpoint)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        endpoint: String,
        label: String,
        metadata: Value,
        interval: Duration,
        registry: Arc<SyncRegistry>,
        poller: TickDrivenPoller,
        processor: DataProcessor,
        optimizer: StateOptimizer,
        clock: SharedClock,
    ) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            endpoint,
            label,
            metadata,
            interval,
            registry,
            poller,
            processor,
            optimizer,
            clock,
            lifecycle: Mutex::new(Lifecycle::default()),
            tick_gate: tokio::sync::Mutex::new(()),
            publish_lock: Mutex::new(()),
            ticks: AtomicU64::new(0),
            tx,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn optimizer(&self) -> &StateOptimizer {
        &self.optimizer
    }

    pub fn processor(&self) -> &DataProcessor {
        &self.processor
    }

    pub fn connection(&self) -> &Arc<ConnectionController> {
        self.poller.controller()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn token(&self) -> Option<RegistrationToken> {
        self.lifecycle().token.clone()
    }

    /// Our token, if the registry still holds it. A reaped token is dropped
    /// along with the timer it was driving.
    fn live_token(&self) -> Option<RegistrationToken> {
        let token = self.token()?;
        if self.registry.is_active(&token) {
            return Some(token);
        }
        let timer = {
            let mut lc = self.lifecycle();
            if lc.token.as_ref() != Some(&token) {
                return None;
            }
            lc.token = None;
            lc.timer.take()
        };
        if let Some(t) = timer {
            t.cancel();
        }
        self.poller.stop();
        warn!(
            endpoint = %self.endpoint,
            label = %self.label,
            token = %token,
            "registration was reaped, synchronizer stopped"
        );
        None
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle().timer.is_some()
    }

    fn kill_switch_engaged(&self) -> bool {
        self.connection()
            .coordinator()
            .controls()
            .kill_switch()
            .is_engaged()
    }

    /// Admit this orchestrator and start its timer.
    ///
    /// `None` when another synchronizer owns the endpoint or the kill switch
    /// is engaged. Calling `start` again while running returns the same token.
    pub fn start(self: &Arc<Self>) -> Option<RegistrationToken> {
        if let Some(token) = self.live_token() {
            return Some(token);
        }
        let mut lc = self.lifecycle();
        if let Some(token) = &lc.token {
            // another caller started us in between
            return Some(token.clone());
        }
        if self.kill_switch_engaged() {
            warn!(endpoint = %self.endpoint, label = %self.label, "kill switch engaged, not starting");
            return None;
        }
        let token = self
            .registry
            .admit(&self.endpoint, &self.label, self.metadata.clone())?;

        self.poller.start();
        let cancel = CancellationToken::new();
        spawn_timer(Arc::downgrade(self), self.interval, cancel.clone());

        lc.token = Some(token.clone());
        lc.timer = Some(cancel);
        info!(
            endpoint = %self.endpoint,
            label = %self.label,
            interval_ms = self.interval.as_millis() as u64,
            "synchronizer started"
        );
        Some(token)
    }

    /// Cancel the timer, invalidate in-flight results and release the
    /// registration. Returns whether a registration was released.
    pub fn stop(&self) -> bool {
        let (timer, token) = {
            let mut lc = self.lifecycle();
            (lc.timer.take(), lc.token.take())
        };
        if let Some(t) = timer {
            t.cancel();
        }
        self.poller.stop();
        let released = token
            .as_ref()
            .map(|t| self.registry.release(t))
            .unwrap_or(false);
        if token.is_some() {
            info!(endpoint = %self.endpoint, label = %self.label, "synchronizer stopped");
        }
        released
    }

    /// One timer cycle. Never raises.
    pub async fn tick(&self) -> TickOutcome {
        if self.token().is_none() {
            return TickOutcome::Inactive;
        }
        let _gate = self.tick_gate.lock().await;
        let Some(token) = self.live_token() else {
            return TickOutcome::Inactive;
        };
        let n = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        if self.kill_switch_engaged() {
            // a paused synchronizer is still alive
            self.registry.track_activity(
                &token,
                ActivityKind::Info,
                json!({ "tick": n, "skipped": "kill switch engaged" }),
            );
            return self.skip("kill switch engaged");
        }

        let controller = self.poller.controller();
        let epoch = controller.epoch();
        self.registry
            .track_activity(&token, ActivityKind::Request, json!({ "tick": n }));

        let Some(raw) = self.poller.poll_once().await else {
            return match controller.last_error() {
                Some(e) if controller.epoch() == epoch => {
                    self.registry.track_activity(
                        &token,
                        ActivityKind::Error,
                        json!({ "tick": n, "error": e.to_string() }),
                    );
                    self.lifecycle().last_error = Some(e.to_string());
                    TickOutcome::Failed(e)
                }
                _ => TickOutcome::Skipped("superseded by restart".to_string()),
            };
        };

        let outcome = self.processor.process((*raw).clone()).await;
        if let Some(e) = outcome.error {
            self.registry.track_activity(
                &token,
                ActivityKind::Error,
                json!({ "tick": n, "error": e.to_string() }),
            );
            self.lifecycle().last_error = Some(e.to_string());
            return TickOutcome::Failed(e);
        }
        let data = match (outcome.processed, outcome.data) {
            (true, Some(data)) => data,
            _ => {
                let reason = outcome.reason.unwrap_or_else(|| "payload rejected".to_string());
                self.registry.track_activity(
                    &token,
                    ActivityKind::Info,
                    json!({ "tick": n, "skipped": reason }),
                );
                return self.skip(reason);
            }
        };

        if controller.epoch() != epoch {
            return TickOutcome::Skipped("superseded by restart".to_string());
        }

        let stable = self.publish(data);
        if stable.changed() {
            self.registry
                .track_activity(&token, ActivityKind::Render, json!({ "hash": stable.hash }));
            TickOutcome::Published(stable)
        } else {
            TickOutcome::Unchanged(stable)
        }
    }

    fn skip(&self, reason: impl Into<String>) -> TickOutcome {
        let reason = reason.into();
        debug!(endpoint = %self.endpoint, reason = %reason, "cycle skipped");
        self.lifecycle().last_error = Some(reason.clone());
        TickOutcome::Skipped(reason)
    }

    fn publish_guard(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, data: Value) -> StableData {
        let _publishing = self.publish_guard();
        let stable = self.optimizer.get_stable_data(Arc::new(data));
        if stable.changed() {
            self.tx.send_replace(Some(Arc::clone(&stable.data)));
        }
        let mut lc = self.lifecycle();
        lc.last_error = None;
        if stable.changed() {
            lc.last_update = Some(self.clock.now());
        }
        stable
    }

    /// Run the pipeline once, now, and propagate any failure.
    pub async fn refresh(&self) -> Result<StableData> {
        let token = self.live_token();
        if token.is_none() {
            if let Some(owner) = self.registry.owner_of(&self.endpoint) {
                debug!(endpoint = %self.endpoint, label = %self.label, owner = %owner, "refresh refused");
                return Err(Error::runtime_with_context(
                    format!("endpoint is owned by synchronizer {}", owner),
                    ErrorContext::new()
                        .with_source("orchestrator")
                        .with_endpoint(self.endpoint.clone()),
                ));
            }
        }
        let controller = self.poller.controller();
        let epoch = controller.epoch();
        if let Some(t) = &token {
            self.registry
                .track_activity(t, ActivityKind::Request, json!({ "refresh": true }));
        }

        let result = self.run_refresh(controller, epoch).await;

        if let (Err(e), Some(t)) = (&result, &token) {
            self.registry.track_activity(
                t,
                ActivityKind::Error,
                json!({ "refresh": true, "error": e.to_string() }),
            );
        }
        result
    }

    async fn run_refresh(&self, controller: &ConnectionController, epoch: u64) -> Result<StableData> {
        let raw = controller.fetch_checked().await?;
        let data = self
            .processor
            .process((*raw).clone())
            .await
            .into_result(&self.endpoint)?;
        if controller.epoch() != epoch {
            return Err(Error::runtime_with_context(
                "refresh superseded by restart",
                ErrorContext::new()
                    .with_source("orchestrator")
                    .with_endpoint(self.endpoint.clone()),
            ));
        }
        Ok(self.publish(data))
    }

    /// Clear processing and optimization state and restart the connection.
    pub fn reset_system(&self) {
        self.processor.reset();
        self.poller.controller().reset();
        {
            let _publishing = self.publish_guard();
            self.optimizer.reset();
            self.tx.send_replace(None);
        }
        {
            let mut lc = self.lifecycle();
            lc.last_update = None;
            lc.last_error = None;
        }
        if self.is_running() {
            self.poller.stop();
            self.poller.start();
        }
        info!(endpoint = %self.endpoint, "synchronizer state reset");
    }

    /// Receives the published snapshot whenever content changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Value>>> {
        self.tx.subscribe()
    }

    pub fn system_status(&self) -> SystemStatus {
        let controller = self.poller.controller();
        SystemStatus::derive(controller.mode(), &controller.stats(), &self.optimizer.stats())
    }

    pub fn view(&self) -> SyncView {
        let controller = self.poller.controller();
        let (error, last_update) = {
            let lc = self.lifecycle();
            (lc.last_error.clone(), lc.last_update)
        };
        SyncView {
            data: self.optimizer.current(),
            is_connected: controller.is_connected(),
            connection_mode: controller.mode(),
            error: error.or_else(|| controller.stats().last_error),
            last_update,
            system_status: self.system_status(),
        }
    }

    pub fn get_system_stats(&self) -> SystemStats {
        let controller = self.poller.controller();
        let coordinator = controller.coordinator();
        SystemStats {
            endpoint: self.endpoint.clone(),
            label: self.label.clone(),
            environment: coordinator.policy().environment().to_string(),
            interval_ms: self.interval.as_millis() as u64,
            running: self.is_running(),
            token: self.token(),
            ticks: self.ticks.load(Ordering::Relaxed),
            connection: controller.stats(),
            processing: self.processor.stats(),
            optimization: self.optimizer.stats(),
            circuit_breaker: coordinator.controls().breaker_snapshot(&self.endpoint),
            rate_limit: coordinator.controls().limiter().snapshot(&self.endpoint),
            coordinator: coordinator.stats(),
            status: self.system_status(),
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        let lc = self.lifecycle.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(t) = lc.timer.take() {
            t.cancel();
        }
        if let Some(token) = lc.token.take() {
            self.registry.release(&token);
        }
    }
}

fn spawn_timer(orchestrator: Weak<SyncOrchestrator>, period: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(orch) = orchestrator.upgrade() else { break };
                    match orch.tick().await {
                        TickOutcome::Failed(e) => {
                            debug!(endpoint = %orch.endpoint, error = %e, "tick failed");
                        }
                        TickOutcome::Inactive => break,
                        _ => {}
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RequestCoordinator;
    use crate::policy::{Environment, EnvironmentPolicy};
    use crate::processing::{FieldKind, SchemaValidator};
    use crate::resilience::SafetyControls;
    use crate::transport::FnFetcher;

    fn services(payload: Value) -> (Arc<SyncRegistry>, Arc<RequestCoordinator>) {
        let fetcher = FnFetcher::shared(move |_| {
            let p = payload.clone();
            async move { Ok(p) }
        });
        (
            Arc::new(SyncRegistry::default()),
            Arc::new(RequestCoordinator::new(
                fetcher,
                Arc::new(SafetyControls::default()),
                EnvironmentPolicy::for_environment(Environment::Test),
            )),
        )
    }

    #[test]
    fn test_build_requires_services() {
        let err = SyncOrchestrator::builder("/api/sessions").build().err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        let (registry, coordinator) = services(json!({}));
        let err = SyncOrchestrator::builder("")
            .with_registry(registry)
            .with_coordinator(coordinator)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_build_rejects_interval_beyond_stale_after() {
        let (_, coordinator) = services(json!({}));
        let registry = Arc::new(SyncRegistry::new(
            crate::registry::RegistryConfig::default().with_stale_after(Duration::from_secs(30)),
        ));
        let err = SyncOrchestrator::builder("/api/sessions")
            .with_registry(registry.clone())
            .with_coordinator(coordinator.clone())
            .with_interval(Duration::from_secs(31))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        assert!(SyncOrchestrator::builder("/api/sessions")
            .with_registry(registry)
            .with_coordinator(coordinator)
            .with_interval(Duration::from_secs(30))
            .build()
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_refused_while_another_synchronizer_owns_endpoint() {
        let (registry, coordinator) = services(json!({"items": []}));
        let owner = SyncOrchestrator::builder("/api/sessions")
            .with_label("CompA")
            .with_registry(registry.clone())
            .with_coordinator(coordinator.clone())
            .build()
            .unwrap();
        let rejected = SyncOrchestrator::builder("/api/sessions")
            .with_label("CompB")
            .with_registry(registry)
            .with_coordinator(coordinator)
            .build()
            .unwrap();

        // standalone reads are fine while nobody owns the endpoint
        assert!(rejected.refresh().await.is_ok());

        owner.start().unwrap();
        assert!(rejected.start().is_none());
        let attempts = rejected.connection().stats().attempts;
        let err = rejected.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
        assert!(err.to_string().contains("CompA"));
        assert_eq!(rejected.connection().stats().attempts, attempts);

        assert!(owner.refresh().await.is_ok());
        owner.stop();
    }

    #[tokio::test]
    async fn test_tick_without_registration_is_inactive() {
        let (registry, coordinator) = services(json!({"items": []}));
        let orch = SyncOrchestrator::builder("/api/sessions")
            .with_registry(registry)
            .with_coordinator(coordinator)
            .build()
            .unwrap();
        assert!(matches!(orch.tick().await, TickOutcome::Inactive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_orchestrator_is_rejected() {
        let (registry, coordinator) = services(json!({"items": []}));
        let a = SyncOrchestrator::builder("/api/sessions")
            .with_label("CompA")
            .with_registry(registry.clone())
            .with_coordinator(coordinator.clone())
            .build()
            .unwrap();
        let b = SyncOrchestrator::builder("/api/sessions")
            .with_label("CompB")
            .with_registry(registry.clone())
            .with_coordinator(coordinator)
            .build()
            .unwrap();

        let token = a.start().unwrap();
        assert_eq!(a.start(), Some(token));
        assert!(b.start().is_none());
        assert_eq!(registry.stats().rejections, 1);

        assert!(a.stop());
        assert!(b.start().is_some());
        b.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_skips_cycle() {
        let (registry, coordinator) = services(json!({"wrong": true}));
        let orch = SyncOrchestrator::builder("/api/sessions")
            .with_registry(registry)
            .with_coordinator(coordinator)
            .with_validator(Arc::new(SchemaValidator::new().require("items", FieldKind::Array)))
            .build()
            .unwrap();
        orch.start().unwrap();

        match orch.tick().await {
            TickOutcome::Skipped(reason) => assert!(reason.contains("items")),
            other => panic!("expected Skipped, got {:?}", other),
        }
        assert!(orch.view().error.is_some());
        assert!(orch.view().data.is_none());

        let err = orch.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        orch.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_system_clears_state() {
        let (registry, coordinator) = services(json!({"items": [1]}));
        let orch = SyncOrchestrator::builder("/api/sessions")
            .with_registry(registry)
            .with_coordinator(coordinator)
            .build()
            .unwrap();
        let first = orch.refresh().await.unwrap();
        assert!(first.changed());

        orch.reset_system();
        assert!(orch.view().data.is_none());
        assert_eq!(orch.optimizer().stats().allowed, 0);
        assert_eq!(orch.connection().stats().attempts, 0);

        // after a reset the same content publishes again
        assert!(orch.refresh().await.unwrap().changed());
    }
}
