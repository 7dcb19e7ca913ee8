//! Runtime configuration types.
//!
//! `RuntimeConfig` groups the numeric/boolean knobs consumed when the runtime
//! components are constructed. Every field has a default, so a partial (or
//! empty) document deserializes cleanly. Loading the document from disk or
//! the environment is left to the caller.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ErrorKind};

/// Top-level configuration for the orchestration runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Defaults applied to every circuit breaker.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-dependency overrides keyed by breaker name (e.g. "secret-access").
    #[serde(default)]
    pub breakers: HashMap<String, CircuitBreakerConfig>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl RuntimeConfig {
    /// Breaker configuration for `name`, falling back to the shared defaults.
    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        self.breakers
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        for config in self.breakers.values() {
            config.validate()?;
        }
        self.pool.validate()?;
        self.batch.validate()?;
        self.cache.validate()?;
        self.engine.validate()
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Half-open successes needed to close the circuit again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time after the last failure before an open circuit admits a trial call.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Maximum trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Length of the rolling failure window.
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,

    /// Error kinds that count as failures. Anything else passes through
    /// without affecting the breaker.
    #[serde(default = "default_failure_kinds")]
    pub failure_kinds: Vec<ErrorKind>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_window_size_ms() -> u64 {
    60_000
}

fn default_failure_kinds() -> Vec<ErrorKind> {
    vec![
        ErrorKind::Timeout,
        ErrorKind::ResourceExhausted,
        ErrorKind::Connection,
        ErrorKind::Api,
        ErrorKind::Unexpected,
    ]
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            window_size_ms: default_window_size_ms(),
            failure_kinds: default_failure_kinds(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    pub fn counts_as_failure(&self, kind: ErrorKind) -> bool {
        self.failure_kinds.contains(&kind)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const SECTION: &str = "circuit_breaker";
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(SECTION, "failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(SECTION, "success_threshold must be at least 1"));
        }
        if self.half_open_max_calls < self.success_threshold {
            return Err(ConfigError::invalid(
                SECTION,
                format!(
                    "half_open_max_calls ({}) must be >= success_threshold ({})",
                    self.half_open_max_calls, self.success_threshold
                ),
            ));
        }
        if self.window_size_ms == 0 {
            return Err(ConfigError::invalid(SECTION, "window_size_ms must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open by maintenance.
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Hard bound on live connections (idle + in use + being created).
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// How long `acquire` waits for a free connection.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Idle connections older than this are closed by maintenance.
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,

    /// Connections older than this are closed regardless of use.
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,

    /// Period of the background maintenance task.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    10
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_max_idle_time_ms() -> u64 {
    300_000
}

fn default_max_lifetime_ms() -> u64 {
    3_600_000
}

fn default_maintenance_interval_ms() -> u64 {
    60_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const SECTION: &str = "pool";
        if self.max_size == 0 {
            return Err(ConfigError::invalid(SECTION, "max_size must be greater than zero"));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::invalid(
                SECTION,
                format!(
                    "min_size ({}) must not exceed max_size ({})",
                    self.min_size, self.max_size
                ),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::invalid(
                SECTION,
                "maintenance_interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batch processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// A batch is drained once this many items are queued.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Upper bound on items per batch call; reaching it forces a flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Oldest-item age that forces a drain below `min_batch_size`.
    #[serde(default = "default_max_wait_time_ms")]
    pub max_wait_time_ms: u64,

    /// How often the worker wakes up on its own.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Retries per item before its ticket fails.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Optional bound on a single batch call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_ms: Option<u64>,
}

fn default_min_batch_size() -> usize {
    10
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_wait_time_ms() -> u64 {
    1_000
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_max_retry_count() -> u32 {
    3
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            max_wait_time_ms: default_max_wait_time_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retry_count: default_max_retry_count(),
            batch_timeout_ms: None,
        }
    }
}

impl BatchConfig {
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const SECTION: &str = "batch";
        if self.min_batch_size == 0 || self.max_batch_size == 0 {
            return Err(ConfigError::invalid(SECTION, "batch sizes must be greater than zero"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ConfigError::invalid(
                SECTION,
                format!(
                    "min_batch_size ({}) must not exceed max_batch_size ({})",
                    self.min_batch_size, self.max_batch_size
                ),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::invalid(SECTION, "flush_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Where `set` writes in a multi-tier cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Write every tier.
    #[default]
    WriteThrough,
    /// Write only the fastest tier; slower tiers fill on their own.
    FastestOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries held by an in-memory tier before LRU eviction.
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// TTL applied when `set` is called without one. `None` = no expiry.
    #[serde(default = "default_ttl_ms", skip_serializing_if = "Option::is_none")]
    pub default_ttl_ms: Option<u64>,

    /// Period of the expired-entry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default)]
    pub write_policy: WritePolicy,

    /// TTL used when a hit is back-filled into faster tiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_ttl_ms: Option<u64>,
}

fn default_cache_max_size() -> usize {
    1_000
}

fn default_ttl_ms() -> Option<u64> {
    Some(300_000)
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            default_ttl_ms: default_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            write_policy: WritePolicy::default(),
            promotion_ttl_ms: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn promotion_ttl(&self) -> Option<Duration> {
        self.promotion_ttl_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const SECTION: &str = "cache";
        if self.max_size == 0 {
            return Err(ConfigError::invalid(SECTION, "max_size must be greater than zero"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid(SECTION, "sweep_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workflow engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Steps allowed to run at the same time within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout for steps that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_ms: Option<u64>,

    /// Bound on a whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_timeout_ms: Option<u64>,
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_step_timeout_ms: None,
            workflow_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        self.workflow_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "engine",
                "max_concurrency must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.cache.default_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(config.cache.write_policy, WritePolicy::WriteThrough);
        assert_eq!(config.engine.max_concurrency, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_config_deserialize_empty() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.pool.min_size, 1);
        assert!(config.breakers.is_empty());
        assert!(config.batch.batch_timeout().is_none());
    }

    #[test]
    fn test_runtime_config_deserialize_with_values() {
        let toml_str = r#"
[circuit_breaker]
failure_threshold = 3
reset_timeout_ms = 500
failure_kinds = ["timeout", "api"]

[breakers.secret-access]
failure_threshold = 10

[pool]
min_size = 2
max_size = 4

[cache]
write_policy = "fastest_only"
default_ttl_ms = 1000

[engine]
max_concurrency = 2
workflow_timeout_ms = 60000
"#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 1);
        assert!(config.circuit_breaker.counts_as_failure(ErrorKind::Api));
        assert!(!config.circuit_breaker.counts_as_failure(ErrorKind::NotFound));

        assert_eq!(config.breaker_config("secret-access").failure_threshold, 10);
        assert_eq!(config.breaker_config("object-storage").failure_threshold, 3);

        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.cache.write_policy, WritePolicy::FastestOnly);
        assert_eq!(config.engine.workflow_timeout(), Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_breaker_validation_rejects_unreachable_close() {
        let config = CircuitBreakerConfig {
            success_threshold: 3,
            half_open_max_calls: 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("half_open_max_calls"));
    }

    #[test]
    fn test_pool_validation_rejects_min_above_max() {
        let config = PoolConfig {
            min_size: 5,
            max_size: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_validation_rejects_min_above_max() {
        let config = BatchConfig {
            min_batch_size: 50,
            max_batch_size: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
