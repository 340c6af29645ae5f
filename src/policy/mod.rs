//! 环境策略：部署环境到轮询间隔、并发上限和超时的纯查表映射。
//!
//! # Environment Policy
//!
//! A pure lookup from deployment context to per-resource poll interval,
//! in-flight ceiling and request timeout. The policy is resolved once when an
//! orchestrator is built and treated as immutable afterwards; switching
//! environment mid-run is not supported.
//!
//! Resolution order for any endpoint:
//! 1. per-resource override from [`SyncConfig::resources`](crate::config::SyncConfig)
//! 2. per-resource entry in the environment table
//! 3. the environment default

use crate::config::SyncConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[serde(alias = "dev")]
    Development,
    Test,
    Staging,
    #[default]
    #[serde(alias = "prod")]
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "local" => Some(Environment::Development),
            "test" | "testing" => Some(Environment::Test),
            "staging" | "stage" => Some(Environment::Staging),
            "prod" | "production" => Some(Environment::Production),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved settings for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_inflight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentPolicy {
    environment: Environment,
    default_interval: Duration,
    default_timeout: Duration,
    default_ceiling: usize,
    poll_intervals: HashMap<String, Duration>,
    request_timeouts: HashMap<String, Duration>,
    concurrency_ceilings: HashMap<String, usize>,
}

impl EnvironmentPolicy {
    pub fn for_environment(environment: Environment) -> Self {
        let (interval_ms, timeout_ms, ceiling) = match environment {
            Environment::Production => (5_000, 10_000, 2),
            Environment::Staging => (3_000, 8_000, 2),
            Environment::Development => (2_000, 15_000, 4),
            Environment::Test => (1_000, 2_000, 1),
        };
        let mut policy = Self {
            environment,
            default_interval: Duration::from_millis(interval_ms),
            default_timeout: Duration::from_millis(timeout_ms),
            default_ceiling: ceiling,
            poll_intervals: HashMap::new(),
            request_timeouts: HashMap::new(),
            concurrency_ceilings: HashMap::new(),
        };

        // Session presence changes quickly; board layout rarely does.
        let (sessions_ms, boards_ms) = match environment {
            Environment::Production => (3_000, 10_000),
            Environment::Staging => (2_000, 6_000),
            Environment::Development => (1_500, 4_000),
            Environment::Test => (1_000, 1_000),
        };
        policy
            .poll_intervals
            .insert("/api/sessions".to_string(), Duration::from_millis(sessions_ms));
        policy
            .poll_intervals
            .insert("/api/boards".to_string(), Duration::from_millis(boards_ms));
        policy
    }

    /// Fold per-resource overrides from `config` into the table.
    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        for (endpoint, o) in &config.resources {
            if let Some(ms) = o.interval_ms {
                self.poll_intervals
                    .insert(endpoint.clone(), Duration::from_millis(ms));
            }
            if let Some(ms) = o.timeout_ms {
                self.request_timeouts
                    .insert(endpoint.clone(), Duration::from_millis(ms));
            }
            if let Some(n) = o.max_inflight {
                self.concurrency_ceilings.insert(endpoint.clone(), n);
            }
        }
        self
    }

    /// Policy for `config.environment` with the config's overrides applied.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::for_environment(config.environment).with_config(config)
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn interval_for(&self, endpoint: &str) -> Duration {
        self.poll_intervals
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_interval)
    }

    pub fn timeout_for(&self, endpoint: &str) -> Duration {
        self.request_timeouts
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn ceiling_for(&self, endpoint: &str) -> usize {
        self.concurrency_ceilings
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_ceiling)
            .max(1)
    }

    pub fn resource(&self, endpoint: &str) -> ResourcePolicy {
        ResourcePolicy {
            interval: self.interval_for(endpoint),
            timeout: self.timeout_for(endpoint),
            max_inflight: self.ceiling_for(endpoint),
        }
    }
}

impl Default for EnvironmentPolicy {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceOverride;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("prod"), Some(Environment::Production));
        assert_eq!(Environment::parse("Development"), Some(Environment::Development));
        assert_eq!(Environment::parse("qa"), None);
    }

    #[test]
    fn test_defaults_per_environment() {
        let prod = EnvironmentPolicy::for_environment(Environment::Production);
        assert_eq!(prod.interval_for("/api/unknown"), Duration::from_secs(5));
        assert_eq!(prod.timeout_for("/api/unknown"), Duration::from_secs(10));
        assert_eq!(prod.ceiling_for("/api/unknown"), 2);

        let test = EnvironmentPolicy::for_environment(Environment::Test);
        assert_eq!(test.interval_for("/api/unknown"), Duration::from_secs(1));
        assert_eq!(test.ceiling_for("/api/unknown"), 1);
    }

    #[test]
    fn test_resource_table_beats_default() {
        let prod = EnvironmentPolicy::for_environment(Environment::Production);
        assert_eq!(prod.interval_for("/api/sessions"), Duration::from_secs(3));
        assert_eq!(prod.interval_for("/api/boards"), Duration::from_secs(10));
    }

    #[test]
    fn test_config_override_beats_table() {
        let mut cfg = SyncConfig::default();
        cfg.resources.insert(
            "/api/sessions".to_string(),
            ResourceOverride {
                interval_ms: Some(750),
                timeout_ms: Some(1_000),
                max_inflight: Some(3),
            },
        );
        let policy = EnvironmentPolicy::from_config(&cfg);
        let r = policy.resource("/api/sessions");
        assert_eq!(r.interval, Duration::from_millis(750));
        assert_eq!(r.timeout, Duration::from_secs(1));
        assert_eq!(r.max_inflight, 3);
    }
}
