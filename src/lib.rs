//! # poll-sync
//!
//! 客户端持续同步运行时：在没有推送通道的情况下，用去重的轮询周期让本地状态与远端资源保持一致。
//!
//! Client-side continuous synchronization without a push channel. Keeps local
//! state consistent with remote resources by scheduling deduplicated poll
//! cycles, suppressing redundant downstream updates through content-hash
//! comparison, and degrading gracefully under repeated failure.
//!
//! ## Core Guarantees
//!
//! - **One synchronizer per endpoint**: the [`registry`] refuses duplicate
//!   activations, so accidental double mounts cannot double request volume
//! - **One timer per synchronizer**: the [`orchestrator`] owns the only
//!   interval; the connection layer is tick-driven
//! - **Stable references**: unchanged content hands back the same [`std::sync::Arc`]
//! - **Fail fast under pressure**: circuit breaker, rate limiter and kill
//!   switch in [`resilience`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use poll_sync::config::SyncConfig;
//! use poll_sync::orchestrator::SyncRuntime;
//! use poll_sync::transport::HttpFetcher;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> poll_sync::Result<()> {
//!     let config = SyncConfig::from_env();
//!     poll_sync::logging::init_tracing(&config.debug);
//!
//!     let runtime = SyncRuntime::from_config(config, Arc::new(HttpFetcher::new("http://localhost:8080")?));
//!     let boards = runtime.orchestrator("/api/boards").with_label("BoardView").build()?;
//!     boards.start();
//!
//!     let status = boards.system_status();
//!     println!("healthy={} optimal={}", status.is_healthy, status.is_optimal);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`registry`] | Process-wide ledger, at most one active synchronizer per endpoint |
//! | [`orchestrator`] | Timer, fetch → process → optimize → publish, status and stats |
//! | [`connection`] | Per-endpoint fetch path, reliability statistics, pollers |
//! | [`processing`] | Payload validation and (async) transformation |
//! | [`optimization`] | Essential-projection hashing and stable snapshots |
//! | [`coordinator`] | Request deduplication and in-flight ceilings |
//! | [`resilience`] | Circuit breaker, rate limiter, kill switch |
//! | [`policy`] | Environment → interval / timeout / ceiling lookup |
//! | [`transport`] | Resource fetchers (HTTP, closures) |
//! | [`config`] | YAML / env configuration |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`clock`] | Real and manual clocks |

pub mod clock;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod logging;
pub mod optimization;
pub mod orchestrator;
pub mod policy;
pub mod processing;
pub mod registry;
pub mod resilience;
pub mod transport;

// Re-export main types for convenience
pub use config::SyncConfig;
pub use connection::{ConnectionMode, ConnectionStats};
pub use optimization::{RenderDecision, StableData};
pub use orchestrator::{SyncOrchestrator, SyncRuntime, TickOutcome};
pub use registry::{RegistrationToken, SyncRegistry};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
