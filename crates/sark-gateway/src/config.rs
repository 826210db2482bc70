//! Gateway configuration.
//!
//! Every number the engine uses — limits, TTLs, windows, breaker and retry
//! tuning — lives here with the documented defaults, loaded from YAML and
//! validated before anything starts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sark_core::breaker::BreakerConfig;
use sark_core::cache::CacheConfig;
use sark_core::errors::GatewayError;
use sark_core::fingerprint::FingerprintSpec;
use sark_core::ratelimit::RateLimitConfig;

use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Sse,
    Stdio,
}

/// Resource ceilings and lifecycle tuning for stdio-managed subprocesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioLimits {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_hung_timeout_secs")]
    pub hung_timeout_secs: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// CPU is watched, not killed on: sustained spikes are logged.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_fds")]
    pub max_file_descriptors: usize,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_graceful_stop_secs")]
    pub graceful_stop_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_hung_timeout_secs() -> u64 {
    15
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_max_cpu_percent() -> f32 {
    80.0
}

fn default_max_fds() -> usize {
    1000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_graceful_stop_secs() -> u64 {
    5
}

impl Default for StdioLimits {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
            hung_timeout_secs: default_hung_timeout_secs(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_file_descriptors: default_max_fds(),
            max_restarts: default_max_restarts(),
            graceful_stop_secs: default_graceful_stop_secs(),
        }
    }
}

/// One backend a resource can resolve to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub transport: TransportKind,
    /// Endpoint for HTTP/SSE backends.
    #[serde(default)]
    pub url: Option<String>,
    /// Command line for stdio backends.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Bounded connection pool / concurrency for HTTP (default 100) and
    /// SSE (default 50).
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Hard deadline for one `invoke`, retries included.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Deadline for a single attempt inside the retry loop.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub stdio: StdioLimits,
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

impl BackendConfig {
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            url: Some(url.into()),
            command: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            max_connections: None,
            call_timeout_secs: default_call_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            breaker: None,
            retry: None,
            stdio: StdioLimits::default(),
        }
    }

    pub fn stdio(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            url: None,
            command,
            cwd: None,
            env: HashMap::new(),
            max_connections: None,
            call_timeout_secs: default_call_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            breaker: None,
            retry: None,
            stdio: StdioLimits::default(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(match self.transport {
            TransportKind::Http => 100,
            TransportKind::Sse => 50,
            TransportKind::Stdio => 8,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Per-action-category fingerprint configuration. Which context fields are
/// cache-key-significant is deliberately per category, not a global
/// constant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub default: FingerprintSpec,
    #[serde(default)]
    pub per_category: HashMap<String, FingerprintSpec>,
}

impl FingerprintConfig {
    pub fn spec_for(&self, category: &str) -> &FingerprintSpec {
        self.per_category.get(category).unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Evaluator query answering gateway authorization.
    #[serde(default = "default_policy_query")]
    pub policy_query: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Deny an allowed decision when an untrusted principal targets another
    /// environment.
    #[serde(default = "default_true")]
    pub cross_environment_restriction: bool,
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

fn default_policy_query() -> String {
    "data.gateway.allow".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            policy_query: default_policy_query(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            fingerprint: FingerprintConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            backends: Vec::new(),
            cross_environment_restriction: true,
            audit_log_path: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(source: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_yaml::from_str(source)
            .map_err(|err| GatewayError::invalid_request(format!("config parse: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(GatewayError::invalid_request(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            match backend.transport {
                TransportKind::Http | TransportKind::Sse => {
                    if backend.url.is_none() {
                        return Err(GatewayError::invalid_request(format!(
                            "backend '{}' needs a url",
                            backend.name
                        )));
                    }
                }
                TransportKind::Stdio => {
                    if backend.command.is_empty() {
                        return Err(GatewayError::invalid_request(format!(
                            "backend '{}' needs a command",
                            backend.name
                        )));
                    }
                }
            }
            if backend.call_timeout_secs == 0 {
                return Err(GatewayError::invalid_request(format!(
                    "backend '{}' call timeout must be positive",
                    backend.name
                )));
            }
        }
        Ok(())
    }
}
