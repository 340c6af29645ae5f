use super::controller::ConnectionController;
use super::Poller;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Poller with no timer of its own. Someone else calls
/// [`poll_once`](Poller::poll_once); the orchestrator always uses this one.
pub struct TickDrivenPoller {
    controller: Arc<ConnectionController>,
    running: std::sync::atomic::AtomicBool,
}

impl TickDrivenPoller {
    pub fn new(controller: Arc<ConnectionController>) -> Self {
        Self {
            controller,
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Poller for TickDrivenPoller {
    fn controller(&self) -> &Arc<ConnectionController> {
        &self.controller
    }

    fn start(&self) {
        self.controller.start();
        self.running.store(true, std::sync::atomic::Ordering::Release);
    }

    fn stop(&self) {
        self.controller.stop();
        self.running.store(false, std::sync::atomic::Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire)
    }

    async fn poll_once(&self) -> Option<Arc<Value>> {
        self.controller.fetch_data().await
    }
}

/// Poller that owns its interval task plus a health-check task.
///
/// Fetched payloads are broadcast on a watch channel. Useful for standalone
/// consumers; never wrap one of these in an orchestrator, which brings its
/// own timer.
pub struct SelfSchedulingPoller {
    controller: Arc<ConnectionController>,
    interval: Duration,
    cancel: Mutex<Option<CancellationToken>>,
    tx: watch::Sender<Option<Arc<Value>>>,
}

impl SelfSchedulingPoller {
    pub fn new(controller: Arc<ConnectionController>, interval: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            controller,
            interval,
            cancel: Mutex::new(None),
            tx,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Value>>> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Poller for SelfSchedulingPoller {
    fn controller(&self) -> &Arc<ConnectionController> {
        &self.controller
    }

    fn start(&self) {
        let mut slot = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }
        self.controller.start();
        let token = CancellationToken::new();

        let controller = Arc::clone(&self.controller);
        let tx = self.tx.clone();
        let cancel = token.clone();
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(data) = controller.fetch_data().await {
                            tx.send_replace(Some(data));
                        }
                    }
                }
            }
            debug!(endpoint = %controller.endpoint(), "poll loop exited");
        });

        let controller = Arc::clone(&self.controller);
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        controller.check_health(period);
                    }
                }
            }
        });

        *slot = Some(token);
    }

    fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
            self.controller.stop();
        }
    }

    fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    async fn poll_once(&self) -> Option<Arc<Value>> {
        let data = self.controller.fetch_data().await;
        if let Some(d) = &data {
            self.tx.send_replace(Some(Arc::clone(d)));
        }
        data
    }
}

impl Drop for SelfSchedulingPoller {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }
}
