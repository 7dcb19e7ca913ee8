//! Point-in-time status and metrics snapshots for runtime components.
//!
//! Produced by the breaker, pool, batch processor and cache for logs
//! and run artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted in the rolling window.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A bounded number of trial calls probe the dependency.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatusInfo {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the rolling window.
    pub window_failures: usize,
    pub window_size: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    /// Live connections: idle + in use.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections currently being opened.
    pub pending: usize,
    pub waiters: usize,
    pub max_size: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub total_acquired: u64,
    pub acquire_timeouts: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub name: String,
    pub items_submitted: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub items_retried: u64,
    pub items_cancelled: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub pending: usize,
    pub average_batch_size: f64,
    pub average_processing_ms: f64,
    /// Succeeded / (succeeded + failed); 1.0 before anything resolved.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}
