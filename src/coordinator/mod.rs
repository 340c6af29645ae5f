//! 请求协调器：合并并发的相同请求，并按资源限制在途请求数。
//!
//! # Request Coordinator
//!
//! Every fetch in the process goes through one [`RequestCoordinator`]. For a
//! single call the gates run in this order:
//!
//! ```text
//! kill switch → dedup → rate limiter → circuit breaker → in-flight permit → fetch (timeout)
//! ```
//!
//! Background requests for an endpoint that already has a background fetch in
//! flight join that fetch instead of issuing a new one; joiners consume no
//! rate budget and never touch the breaker. Interactive requests (explicit
//! refreshes) always issue a fresh fetch, bounded by the endpoint's in-flight
//! ceiling.
//!
//! Fetches run on their own task, so dropping a waiter never aborts a request
//! that is already on the wire.

use crate::policy::EnvironmentPolicy;
use crate::resilience::{CircuitBreaker, RequestPriority, SafetyControls};
use crate::transport::ResourceFetcher;
use crate::{Error, ErrorContext, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<serde_json::Value>>>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub issued: u64,
    pub deduplicated: u64,
    pub short_circuited: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub successes: u64,
    pub failures: u64,
}

struct AtomicStats {
    issued: AtomicU64,
    deduplicated: AtomicU64,
    short_circuited: AtomicU64,
    rate_limited: AtomicU64,
    timeouts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn to_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            issued: self.issued.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

pub struct RequestCoordinator {
    fetcher: Arc<dyn ResourceFetcher>,
    controls: Arc<SafetyControls>,
    policy: EnvironmentPolicy,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    inflight: Arc<Mutex<HashMap<String, (u64, SharedFetch)>>>,
    next_id: AtomicU64,
    stats: Arc<AtomicStats>,
}

impl RequestCoordinator {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        controls: Arc<SafetyControls>,
        policy: EnvironmentPolicy,
    ) -> Self {
        Self {
            fetcher,
            controls,
            policy,
            semaphores: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            stats: Arc::new(AtomicStats::new()),
        }
    }

    pub fn controls(&self) -> &Arc<SafetyControls> {
        &self.controls
    }

    pub fn policy(&self) -> &EnvironmentPolicy {
        &self.policy
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.to_stats()
    }

    /// Number of distinct endpoints with a shared background fetch in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn semaphore_for(&self, endpoint: &str) -> Arc<Semaphore> {
        let mut map = match self.semaphores.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.policy.ceiling_for(endpoint))))
            .clone()
    }

    /// Fetch `endpoint` through every safety gate, using the policy timeout.
    pub async fn execute(
        &self,
        endpoint: &str,
        priority: RequestPriority,
    ) -> Result<Arc<serde_json::Value>> {
        let timeout = self.policy.timeout_for(endpoint);
        self.execute_with_timeout(endpoint, priority, timeout).await
    }

    pub async fn execute_with_timeout(
        &self,
        endpoint: &str,
        priority: RequestPriority,
        timeout: Duration,
    ) -> Result<Arc<serde_json::Value>> {
        if self.controls.kill_switch().is_engaged() {
            self.stats.short_circuited.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Disabled);
        }

        let fetch = match priority {
            RequestPriority::Background => {
                // check-and-insert under one lock so racing callers see one fetch
                let mut inflight = self.inflight.lock().map_err(|_| {
                    Error::runtime_with_context(
                        "in-flight table poisoned",
                        ErrorContext::new().with_source("request_coordinator"),
                    )
                })?;
                if let Some((_, existing)) = inflight.get(endpoint) {
                    self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint, "joining in-flight fetch");
                    existing.clone()
                } else {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let fetch = self.admit(endpoint, priority, timeout, Some(id))?;
                    inflight.insert(endpoint.to_string(), (id, fetch.clone()));
                    fetch
                }
            }
            RequestPriority::Interactive => self.admit(endpoint, priority, timeout, None)?,
        };

        fetch.await
    }

    /// Run the rate-limit and breaker gates, then start the fetch task.
    fn admit(
        &self,
        endpoint: &str,
        priority: RequestPriority,
        timeout: Duration,
        dedup_id: Option<u64>,
    ) -> Result<SharedFetch> {
        if let Err(e) = self.controls.limiter().try_acquire(endpoint, priority) {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        let breaker = self.controls.breaker_for(endpoint);
        if let Err(e) = breaker.allow() {
            self.stats.short_circuited.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint, "circuit open, skipping network attempt");
            return Err(e);
        }

        self.stats.issued.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_fetch(
            Arc::clone(&self.fetcher),
            breaker,
            self.semaphore_for(endpoint),
            endpoint.to_string(),
            timeout,
            Arc::clone(&self.stats),
            dedup_id.map(|id| (id, Arc::clone(&self.inflight))),
        ));

        let endpoint = endpoint.to_string();
        Ok(async move {
            handle.await.unwrap_or_else(|e| {
                Err(Error::runtime_with_context(
                    format!("fetch task failed: {}", e),
                    ErrorContext::new()
                        .with_source("request_coordinator")
                        .with_endpoint(endpoint),
                ))
            })
        }
        .boxed()
        .shared())
    }
}

async fn run_fetch(
    fetcher: Arc<dyn ResourceFetcher>,
    breaker: Arc<CircuitBreaker>,
    semaphore: Arc<Semaphore>,
    endpoint: String,
    timeout: Duration,
    stats: Arc<AtomicStats>,
    dedup: Option<(u64, Arc<Mutex<HashMap<String, (u64, SharedFetch)>>>)>,
) -> Result<Arc<serde_json::Value>> {
    let attempt = async {
        let _permit = semaphore.acquire_owned().await.map_err(|_| {
            Error::runtime_with_context(
                "in-flight semaphore closed",
                ErrorContext::new()
                    .with_source("request_coordinator")
                    .with_endpoint(endpoint.clone()),
            )
        })?;
        fetcher.fetch(&endpoint).await
    };

    let outcome = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(value)) => {
            breaker.on_success();
            stats.successes.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(value))
        }
        Ok(Err(e)) => {
            breaker.on_failure();
            stats.failures.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
        Err(_) => {
            breaker.on_failure();
            stats.failures.fetch_add(1, Ordering::Relaxed);
            stats.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "fetch timed out");
            Err(Error::Timeout {
                endpoint: endpoint.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };

    if let Some((id, inflight)) = dedup {
        if let Ok(mut map) = inflight.lock() {
            if map.get(&endpoint).map(|(current, _)| *current == id).unwrap_or(false) {
                map.remove(&endpoint);
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Environment;
    use crate::resilience::{CircuitBreakerConfig, KillSwitch, RateLimiterConfig};
    use crate::transport::FnFetcher;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn coordinator(
        fetcher: Arc<dyn ResourceFetcher>,
        threshold: u32,
        max_requests: u32,
    ) -> RequestCoordinator {
        let controls = Arc::new(SafetyControls::new(
            CircuitBreakerConfig::new().with_failure_threshold(threshold),
            RateLimiterConfig::new()
                .with_max_requests(max_requests)
                .with_burst(1),
            KillSwitch::default(),
        ));
        RequestCoordinator::new(
            fetcher,
            controls,
            EnvironmentPolicy::for_environment(Environment::Test),
        )
    }

    #[tokio::test]
    async fn test_concurrent_background_requests_are_deduplicated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fetcher = FnFetcher::shared(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({"items": []}))
            }
        });
        let coord = coordinator(fetcher, 5, 100);

        let (a, b, d) = tokio::join!(
            coord.execute("/api/sessions", RequestPriority::Background),
            coord.execute("/api/sessions", RequestPriority::Background),
            coord.execute("/api/sessions", RequestPriority::Background),
        );
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &d.unwrap()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = coord.stats();
        assert_eq!(stats.issued, 1);
        assert_eq!(stats.deduplicated, 2);
        assert_eq!(coord.inflight_count(), 0);
        // joiners do not consume rate budget
        assert_eq!(coord.controls().limiter().snapshot("/api/sessions").used, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_network() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fetcher = FnFetcher::shared(move |endpoint| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport_with_context(
                    "connection refused",
                    ErrorContext::new().with_endpoint(endpoint),
                ))
            }
        });
        let coord = coordinator(fetcher, 2, 100);

        for _ in 0..2 {
            assert!(coord
                .execute("/api/boards", RequestPriority::Background)
                .await
                .is_err());
        }
        let err = coord
            .execute("/api/boards", RequestPriority::Background)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coord.stats().short_circuited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let fetcher = FnFetcher::shared(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        });
        let coord = coordinator(fetcher, 1, 100);

        let err = coord
            .execute_with_timeout("/slow", RequestPriority::Background, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 100, .. }));
        assert!(coord.controls().breaker_for("/slow").is_open());
        assert_eq!(coord.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fetcher = FnFetcher::shared(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        });
        let coord = coordinator(fetcher, 5, 100);
        coord.controls().kill_switch().engage();

        let err = coord
            .execute("/api/sessions", RequestPriority::Interactive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disabled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_not_issued() {
        let fetcher = FnFetcher::shared(|_| async { Ok(json!({})) });
        let coord = coordinator(fetcher, 5, 1);

        coord
            .execute("/api/sessions", RequestPriority::Background)
            .await
            .unwrap();
        let err = coord
            .execute("/api/sessions", RequestPriority::Background)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        // the burst allowance is reserved for interactive requests
        assert!(coord
            .execute("/api/sessions", RequestPriority::Interactive)
            .await
            .is_ok());
        assert_eq!(coord.stats().issued, 2);
        assert_eq!(coord.stats().rate_limited, 1);
    }
}
