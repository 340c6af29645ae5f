//! 同步注册表：保证每个端点在进程内最多只有一个活跃的同步器
//!
//! # Sync Registry
//!
//! Process-wide ledger of who owns which endpoint. Construct one at startup,
//! share it (`Arc`) with every orchestrator, and call [`SyncRegistry::reset`]
//! between tests.
//!
//! Admission is a check-and-insert under one lock, so concurrent
//! orchestrators racing for the same endpoint produce exactly one token.
//! Rejection is not an error: [`SyncRegistry::admit`] returns `None`.
//!
//! Registrations that show no activity for `stale_after` are reaped by
//! [`SyncRegistry::sweep_stale`], which [`SyncRegistry::spawn_sweeper`] runs
//! periodically.

use crate::clock::{system_clock, SharedClock};
use crate::config::RegistrySettings;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Proof of ownership of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub history_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&RegistrySettings::default())
    }
}

impl RegistryConfig {
    pub fn from_settings(s: &RegistrySettings) -> Self {
        Self {
            stale_after: Duration::from_millis(s.stale_after_ms),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms),
            history_capacity: s.history_capacity.max(1),
        }
    }

    pub fn with_stale_after(mut self, d: Duration) -> Self {
        self.stale_after = d;
        self
    }

    pub fn with_sweep_interval(mut self, d: Duration) -> Self {
        self.sweep_interval = d;
        self
    }

    pub fn with_history_capacity(mut self, n: usize) -> Self {
        self.history_capacity = n.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A fetch was issued. Bumps the request count.
    Request,
    /// A cycle failed. Bumps the error count.
    Error,
    /// A new snapshot was published.
    Render,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub data: Value,
    #[serde(skip)]
    pub at: Instant,
}

struct Registration {
    token: RegistrationToken,
    label: String,
    metadata: Value,
    started_at: Instant,
    request_count: u64,
    error_count: u64,
    last_activity: Instant,
    history: VecDeque<ActivityEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationDetail {
    pub endpoint: String,
    pub label: String,
    pub token: RegistrationToken,
    pub metadata: Value,
    pub uptime_ms: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub since_last_activity_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub admissions: u64,
    pub rejections: u64,
    pub releases: u64,
    pub reaped: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub registrations: Vec<RegistrationDetail>,
}

#[derive(Default)]
struct Ledger {
    by_endpoint: HashMap<String, Registration>,
    endpoint_of: HashMap<RegistrationToken, String>,
    admissions: u64,
    rejections: u64,
    releases: u64,
    reaped: u64,
}

pub struct SyncRegistry {
    config: RegistryConfig,
    clock: SharedClock,
    ledger: Mutex<Ledger>,
}

impl SyncRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RegistryConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim `endpoint` for `label`. `None` if someone else already owns it.
    pub fn admit(&self, endpoint: &str, label: &str, metadata: Value) -> Option<RegistrationToken> {
        if endpoint.trim().is_empty() {
            warn!(label, "refusing to register an empty endpoint");
            return None;
        }
        let now = self.clock.now();
        let mut ledger = self.ledger();

        if let Some(existing) = ledger.by_endpoint.get(endpoint) {
            let owner = existing.label.clone();
            ledger.rejections += 1;
            warn!(
                endpoint,
                label,
                owner = %owner,
                rejections = ledger.rejections,
                "endpoint already has an active synchronizer, admission rejected"
            );
            return None;
        }

        let token = RegistrationToken::generate();
        ledger.by_endpoint.insert(
            endpoint.to_string(),
            Registration {
                token: token.clone(),
                label: label.to_string(),
                metadata,
                started_at: now,
                request_count: 0,
                error_count: 0,
                last_activity: now,
                history: VecDeque::new(),
            },
        );
        ledger.endpoint_of.insert(token.clone(), endpoint.to_string());
        ledger.admissions += 1;
        info!(endpoint, label, token = %token, "synchronizer registered");
        Some(token)
    }

    /// Give up ownership. `false` if `token` is not the current owner.
    pub fn release(&self, token: &RegistrationToken) -> bool {
        let mut ledger = self.ledger();
        let Some(endpoint) = ledger.endpoint_of.get(token).cloned() else {
            debug!(token = %token, "release of unknown token ignored");
            return false;
        };
        let owns = ledger
            .by_endpoint
            .get(&endpoint)
            .map(|r| &r.token == token)
            .unwrap_or(false);
        if !owns {
            ledger.endpoint_of.remove(token);
            return false;
        }
        ledger.by_endpoint.remove(&endpoint);
        ledger.endpoint_of.remove(token);
        ledger.releases += 1;
        info!(endpoint = %endpoint, token = %token, "synchronizer released");
        true
    }

    pub fn is_active(&self, token: &RegistrationToken) -> bool {
        self.ledger().endpoint_of.contains_key(token)
    }

    /// Label of the current owner of `endpoint`.
    pub fn owner_of(&self, endpoint: &str) -> Option<String> {
        self.ledger()
            .by_endpoint
            .get(endpoint)
            .map(|r| r.label.clone())
    }

    /// Record activity against a registration. `false` for unknown tokens.
    pub fn track_activity(&self, token: &RegistrationToken, kind: ActivityKind, data: Value) -> bool {
        let now = self.clock.now();
        let capacity = self.config.history_capacity;
        let mut ledger = self.ledger();
        let Some(endpoint) = ledger.endpoint_of.get(token).cloned() else {
            return false;
        };
        let Some(reg) = ledger.by_endpoint.get_mut(&endpoint) else {
            return false;
        };
        match kind {
            ActivityKind::Request => reg.request_count += 1,
            ActivityKind::Error => reg.error_count += 1,
            ActivityKind::Render | ActivityKind::Info => {}
        }
        reg.last_activity = now;
        if reg.history.len() >= capacity {
            reg.history.pop_front();
        }
        reg.history.push_back(ActivityEvent { kind, data, at: now });
        true
    }

    /// Oldest-first activity history of a registration.
    pub fn history(&self, token: &RegistrationToken) -> Vec<ActivityEvent> {
        let ledger = self.ledger();
        let history = ledger
            .endpoint_of
            .get(token)
            .and_then(|e| ledger.by_endpoint.get(e))
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default();
        history
    }

    pub fn stats(&self) -> RegistryStats {
        let now = self.clock.now();
        let ledger = self.ledger();
        let mut registrations: Vec<RegistrationDetail> = ledger
            .by_endpoint
            .iter()
            .map(|(endpoint, r)| RegistrationDetail {
                endpoint: endpoint.clone(),
                label: r.label.clone(),
                token: r.token.clone(),
                metadata: r.metadata.clone(),
                uptime_ms: now.saturating_duration_since(r.started_at).as_millis() as u64,
                request_count: r.request_count,
                error_count: r.error_count,
                since_last_activity_ms: now.saturating_duration_since(r.last_activity).as_millis()
                    as u64,
            })
            .collect();
        registrations.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        RegistryStats {
            active: registrations.len(),
            admissions: ledger.admissions,
            rejections: ledger.rejections,
            releases: ledger.releases,
            reaped: ledger.reaped,
            total_requests: registrations.iter().map(|r| r.request_count).sum(),
            total_errors: registrations.iter().map(|r| r.error_count).sum(),
            registrations,
        }
    }

    /// Remove registrations idle longer than `stale_after`. Returns how many.
    pub fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let stale_after = self.config.stale_after;
        let mut ledger = self.ledger();

        let stale: Vec<(String, RegistrationToken, String, Duration)> = ledger
            .by_endpoint
            .iter()
            .filter_map(|(endpoint, r)| {
                let idle = now.saturating_duration_since(r.last_activity);
                (idle > stale_after).then(|| (endpoint.clone(), r.token.clone(), r.label.clone(), idle))
            })
            .collect();

        for (endpoint, token, label, idle) in &stale {
            ledger.by_endpoint.remove(endpoint);
            ledger.endpoint_of.remove(token);
            ledger.reaped += 1;
            warn!(
                endpoint = %endpoint,
                label = %label,
                idle_ms = idle.as_millis() as u64,
                "reaped stale registration"
            );
        }
        stale.len()
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `sweep_interval` until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_stale();
                    }
                }
            }
        })
    }

    /// Drop every registration and zero the counters.
    pub fn reset(&self) {
        *self.ledger() = Ledger::default();
    }
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn registry() -> (SyncRegistry, ManualClock) {
        let clock = ManualClock::new();
        let r = SyncRegistry::with_clock(
            RegistryConfig::default()
                .with_stale_after(Duration::from_secs(300))
                .with_history_capacity(3),
            Arc::new(clock.clone()),
        );
        (r, clock)
    }

    #[test]
    fn test_second_admission_rejected() {
        let (r, _) = registry();
        let a = r.admit("/api/sessions", "CompA", json!({}));
        assert!(a.is_some());
        assert!(r.admit("/api/sessions", "CompB", json!({})).is_none());
        assert_eq!(r.stats().rejections, 1);
        assert_eq!(r.owner_of("/api/sessions").as_deref(), Some("CompA"));
        // other endpoints are independent
        assert!(r.admit("/api/boards", "CompB", json!({})).is_some());
    }

    #[test]
    fn test_release_requires_current_token() {
        let (r, _) = registry();
        let a = r.admit("/api/sessions", "CompA", json!({})).unwrap();
        assert!(r.release(&a));
        assert!(!r.release(&a));

        let b = r.admit("/api/sessions", "CompB", json!({})).unwrap();
        assert!(!r.release(&a));
        assert!(r.is_active(&b));
        assert_eq!(r.stats().releases, 1);
    }

    #[test]
    fn test_activity_counts_and_bounded_history() {
        let (r, _) = registry();
        let t = r.admit("/api/sessions", "CompA", json!({"v": 1})).unwrap();
        for i in 0..4 {
            r.track_activity(&t, ActivityKind::Request, json!({ "i": i }));
        }
        r.track_activity(&t, ActivityKind::Error, json!("timeout"));

        let history = r.history(&t);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data, json!({"i": 2}));
        assert_eq!(history[2].kind, ActivityKind::Error);

        let stats = r.stats();
        assert_eq!(stats.registrations[0].request_count, 4);
        assert_eq!(stats.total_errors, 1);
    }

    #[test]
    fn test_sweep_reaps_idle_registrations() {
        let (r, clock) = registry();
        let idle = r.admit("/api/boards", "Idle", json!({})).unwrap();
        let busy = r.admit("/api/sessions", "Busy", json!({})).unwrap();

        clock.advance(Duration::from_secs(200));
        r.track_activity(&busy, ActivityKind::Request, json!(null));
        clock.advance(Duration::from_secs(101));

        assert_eq!(r.sweep_stale(), 1);
        assert!(!r.is_active(&idle));
        assert!(r.is_active(&busy));
        assert!(!r.track_activity(&idle, ActivityKind::Info, json!(null)));
        assert_eq!(r.stats().reaped, 1);
        // endpoint is free again
        assert!(r.admit("/api/boards", "Next", json!({})).is_some());
    }

    #[test]
    fn test_concurrent_admission_yields_one_token() {
        let r = Arc::new(SyncRegistry::default());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || r.admit("/api/sessions", &format!("c{}", i), json!({})))
            })
            .collect();
        let granted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(granted, 1);
        assert_eq!(r.stats().rejections, 15);
    }

    #[test]
    fn test_reset() {
        let (r, _) = registry();
        r.admit("/api/sessions", "CompA", json!({}));
        r.reset();
        let stats = r.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.admissions, 0);
    }
}
