//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the embedding application. [`init_tracing`] is the convenience used by the
//! bundled binary and by applications that want the `debug.*` config knobs to
//! drive verbosity.

use crate::config::DebugConfig;
use tracing_subscriber::EnvFilter;

/// Build the filter implied by `debug`, letting `RUST_LOG` win when set.
pub fn filter_for(debug: &DebugConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(debug.effective_level().as_filter()))
}

/// Install a global fmt subscriber. Returns `false` if one was already set.
pub fn init_tracing(debug: &DebugConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(debug))
        .with_target(true)
        .try_init()
        .is_ok()
}
