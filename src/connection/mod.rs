//! 连接控制器：负责单个资源的拉取周期、可靠性统计和调度方式。
//!
//! # Connection Controller
//!
//! [`ConnectionController`] owns one endpoint's fetch path and statistics.
//! When fetches happen is decided by a [`Poller`]:
//!
//! | Poller | Timer | Used by |
//! |--------|-------|---------|
//! | [`TickDrivenPoller`] | none; driven from outside | the orchestrator |
//! | [`SelfSchedulingPoller`] | own interval task + health-check task | standalone consumers |
//!
//! Stopping or resetting bumps the controller's epoch; requests already on the
//! wire complete, but their results are dropped without touching statistics.

mod controller;
mod scheduling;
mod stats;

pub use controller::ConnectionController;
pub use scheduling::{SelfSchedulingPoller, TickDrivenPoller};
pub use stats::{ConnectionMode, ConnectionStats};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait Poller: Send + Sync {
    fn controller(&self) -> &Arc<ConnectionController>;

    fn start(&self);

    /// Stop scheduling and invalidate in-flight results.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Run one fetch now. Never raises.
    async fn poll_once(&self) -> Option<Arc<Value>>;
}
