/// Configuration management for the Nodeward engine
///
/// Handles resource ceilings, outbound HTTP policy and the node-type store location.
/// Defaults read NODEWARD_* environment variables for container deployment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default resource ceilings applied to every node execution
    pub limits: ExecutionLimits,
    /// Outbound HTTP policy for the request helper
    pub http: HttpPolicyConfig,
    /// Node-type persistence configuration
    pub store: StoreConfig,
}

/// Resource ceilings for one node execution
///
/// Every field has a default; callers pass a `LimitsOverride` to tighten or relax
/// individual fields for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Wall-clock budget for sandboxed scripts (milliseconds)
    pub timeout_ms: u64,
    /// Memory ceiling for a sandbox state (bytes)
    pub memory_limit: usize,
    /// Maximum serialized output size, also the response-size ceiling (bytes)
    pub max_output_size: usize,
    /// Upper bound for any single outbound request (milliseconds)
    pub max_request_timeout_ms: u64,
    /// Concurrent outbound requests allowed per execution id
    pub max_concurrent_requests: usize,
}

/// Per-call overrides; `None` keeps the configured default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsOverride {
    pub timeout_ms: Option<u64>,
    pub memory_limit: Option<usize>,
    pub max_output_size: Option<usize>,
    pub max_request_timeout_ms: Option<u64>,
    pub max_concurrent_requests: Option<usize>,
}

/// Outbound HTTP policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPolicyConfig {
    /// Skip the loopback/private host check (local development only)
    pub allow_internal_urls: bool,
    /// User agent sent when the node does not provide one
    pub user_agent: String,
    /// Hosts refused on every hop, internal or not; `*.example.com` also covers subdomains
    #[serde(default)]
    pub denied_domains: Vec<String>,
}

/// Node-type store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx connection URL (e.g. "sqlite://data/node_types.db"); None disables persistence
    pub database_url: Option<String>,
}

impl ExecutionLimits {
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MEMORY_LIMIT: usize = 128 * 1024 * 1024;
    pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;
    pub const DEFAULT_MAX_REQUEST_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;

    /// Merge caller overrides over these limits
    pub fn merge(&self, overrides: &LimitsOverride) -> Self {
        Self {
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            memory_limit: overrides.memory_limit.unwrap_or(self.memory_limit),
            max_output_size: overrides.max_output_size.unwrap_or(self.max_output_size),
            max_request_timeout_ms: overrides
                .max_request_timeout_ms
                .unwrap_or(self.max_request_timeout_ms),
            max_concurrent_requests: overrides
                .max_concurrent_requests
                .unwrap_or(self.max_concurrent_requests),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_request_timeout(&self) -> Duration {
        Duration::from_millis(self.max_request_timeout_ms)
    }
}

impl Default for ExecutionLimits {
    /// Built-in ceilings, overridable through NODEWARD_* variables
    fn default() -> Self {
        Self {
            timeout_ms: env_or("NODEWARD_TIMEOUT_MS", Self::DEFAULT_TIMEOUT_MS),
            memory_limit: env_or("NODEWARD_MEMORY_LIMIT_BYTES", Self::DEFAULT_MEMORY_LIMIT),
            max_output_size: env_or("NODEWARD_MAX_OUTPUT_BYTES", Self::DEFAULT_MAX_OUTPUT_SIZE),
            max_request_timeout_ms: env_or(
                "NODEWARD_MAX_REQUEST_TIMEOUT_MS",
                Self::DEFAULT_MAX_REQUEST_TIMEOUT_MS,
            ),
            max_concurrent_requests: env_or(
                "NODEWARD_MAX_CONCURRENT_REQUESTS",
                Self::DEFAULT_MAX_CONCURRENT_REQUESTS,
            ),
        }
    }
}

impl Default for HttpPolicyConfig {
    fn default() -> Self {
        Self {
            allow_internal_urls: std::env::var("NODEWARD_ALLOW_INTERNAL_URLS")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            user_agent: format!("nodeward/{}", env!("CARGO_PKG_VERSION")),
            denied_domains: std::env::var("NODEWARD_DENIED_DOMAINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|domain| domain.trim().to_ascii_lowercase())
                        .filter(|domain| !domain.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("NODEWARD_DATABASE_URL").ok(),
        }
    }
}

impl Default for EngineConfig {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            http: HttpPolicyConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or malformed
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_merges_only_given_fields() {
        let base = ExecutionLimits {
            timeout_ms: 1_000,
            memory_limit: 1024,
            max_output_size: 2048,
            max_request_timeout_ms: 500,
            max_concurrent_requests: 4,
        };
        let merged = base.merge(&LimitsOverride {
            timeout_ms: Some(50),
            max_concurrent_requests: Some(2),
            ..Default::default()
        });

        assert_eq!(merged.timeout_ms, 50);
        assert_eq!(merged.max_concurrent_requests, 2);
        assert_eq!(merged.memory_limit, 1024);
        assert_eq!(merged.max_output_size, 2048);
        assert_eq!(merged.max_request_timeout_ms, 500);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("NODEWARD_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("NODEWARD_TEST_GARBAGE", 7u64), 7);
        std::env::remove_var("NODEWARD_TEST_GARBAGE");
    }
}
