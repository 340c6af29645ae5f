//! Runtime configuration.
//!
//! Loaded from YAML (or built in code) and then overlaid with environment
//! knobs. All values are read once at startup; only the kill switch has a
//! runtime override (see [`crate::resilience::KillSwitch`]).

use crate::policy::Environment;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Verbosity of the runtime's own diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Verbose,
}

impl DebugLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(DebugLevel::Off),
            "error" => Some(DebugLevel::Error),
            "warn" | "warning" => Some(DebugLevel::Warn),
            "info" => Some(DebugLevel::Info),
            "verbose" | "debug" | "trace" => Some(DebugLevel::Verbose),
            _ => None,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            DebugLevel::Off => "off",
            DebugLevel::Error => "error",
            DebugLevel::Warn => "warn",
            DebugLevel::Info => "info",
            DebugLevel::Verbose => "trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub level: DebugLevel,
    /// Log which top-level fields changed whenever the essential hash moves.
    #[serde(alias = "showHashChanges")]
    pub show_hash_changes: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: DebugLevel::Warn,
            show_hash_changes: false,
        }
    }
}

impl DebugConfig {
    pub fn effective_level(&self) -> DebugLevel {
        if self.enabled {
            self.level
        } else {
            DebugLevel::Off
        }
    }
}

/// Per-resource overrides that win over the environment policy table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverride {
    #[serde(alias = "interval")]
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_inflight: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub stale_after_ms: u64,
    pub sweep_interval_ms: u64,
    pub history_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            stale_after_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            history_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub burst: u32,
    pub window_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 60,
            burst: 5,
            window_ms: 60_000,
            sweep_interval_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub environment: Environment,
    pub debug: DebugConfig,
    pub resources: HashMap<String, ResourceOverride>,
    /// Startup half of the emergency kill switch.
    pub kill_switch: bool,
    pub registry: RegistrySettings,
    pub circuit_breaker: BreakerSettings,
    pub rate_limit: RateLimitSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: SyncConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Defaults overlaid with `POLL_SYNC_*` environment knobs.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Overlay `POLL_SYNC_*` environment variables onto this config.
    pub fn apply_env(&mut self) {
        if let Some(e) = env::var("POLL_SYNC_ENV")
            .ok()
            .and_then(|s| Environment::parse(&s))
        {
            self.environment = e;
        }
        if let Some(b) = env_flag("POLL_SYNC_DEBUG") {
            self.debug.enabled = b;
        }
        if let Some(level) = env::var("POLL_SYNC_DEBUG_LEVEL")
            .ok()
            .and_then(|s| DebugLevel::parse(&s))
        {
            self.debug.level = level;
        }
        if let Some(b) = env_flag("POLL_SYNC_SHOW_HASH_CHANGES") {
            self.debug.show_hash_changes = b;
        }
        if let Some(b) = env_flag("POLL_SYNC_DISABLED") {
            self.kill_switch = b;
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_kill_switch(mut self, engaged: bool) -> Self {
        self.kill_switch = engaged;
        self
    }

    pub fn with_resource_interval(mut self, endpoint: impl Into<String>, interval: Duration) -> Self {
        self.resources.entry(endpoint.into()).or_default().interval_ms =
            Some(interval.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (endpoint, o) in &self.resources {
            if endpoint.trim().is_empty() {
                return Err(Error::configuration_with_context(
                    "resource endpoint must not be empty",
                    ErrorContext::new().with_field_path("resources"),
                ));
            }
            if o.interval_ms == Some(0) {
                return Err(Error::configuration_with_context(
                    "interval must be greater than zero",
                    ErrorContext::new()
                        .with_field_path(format!("resources.{}.interval_ms", endpoint)),
                ));
            }
            if let Some(ms) = o.interval_ms {
                if ms > self.registry.stale_after_ms {
                    return Err(Error::configuration_with_context(
                        format!(
                            "interval of {} ms exceeds registry.stale_after_ms ({} ms)",
                            ms, self.registry.stale_after_ms
                        ),
                        ErrorContext::new()
                            .with_field_path(format!("resources.{}.interval_ms", endpoint)),
                    ));
                }
            }
            if o.max_inflight == Some(0) {
                return Err(Error::configuration_with_context(
                    "max_inflight must be greater than zero",
                    ErrorContext::new()
                        .with_field_path(format!("resources.{}.max_inflight", endpoint)),
                ));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::configuration_with_context(
                "failure_threshold must be greater than zero",
                ErrorContext::new().with_field_path("circuit_breaker.failure_threshold"),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(Error::configuration_with_context(
                "window_ms must be greater than zero",
                ErrorContext::new().with_field_path("rate_limit.window_ms"),
            ));
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.environment, Environment::Production);
        assert!(!cfg.kill_switch);
        assert_eq!(cfg.registry.history_capacity, 50);
        assert_eq!(cfg.registry.stale_after_ms, 300_000);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.debug.effective_level(), DebugLevel::Off);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
environment: development
debug:
  enabled: true
  level: verbose
  showHashChanges: true
resources:
  /api/sessions:
    interval: 1500
    max_inflight: 2
kill_switch: false
rate_limit:
  max_requests: 10
  burst: 5
  window_ms: 60000
"#;
        let cfg = SyncConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.debug.effective_level(), DebugLevel::Verbose);
        assert!(cfg.debug.show_hash_changes);
        let sessions = cfg.resources.get("/api/sessions").unwrap();
        assert_eq!(sessions.interval_ms, Some(1500));
        assert_eq!(sessions.max_inflight, Some(2));
        assert_eq!(cfg.rate_limit.max_requests, 10);
        // untouched sections keep their defaults
        assert_eq!(cfg.circuit_breaker.recovery_timeout_ms, 30_000);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = r#"
resources:
  /api/boards:
    interval_ms: 0
"#;
        let err = SyncConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_interval_longer_than_stale_after_rejected() {
        let yaml = r#"
registry:
  stale_after_ms: 60000
resources:
  /api/boards:
    interval_ms: 90000
"#;
        let err = SyncConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("stale_after_ms"));

        let ok = SyncConfig::default().with_resource_interval("/api/boards", Duration::from_secs(300));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_debug_level_parse() {
        assert_eq!(DebugLevel::parse("VERBOSE"), Some(DebugLevel::Verbose));
        assert_eq!(DebugLevel::parse("warning"), Some(DebugLevel::Warn));
        assert_eq!(DebugLevel::parse("loud"), None);
        assert_eq!(DebugLevel::Verbose.as_filter(), "trace");
    }
}
