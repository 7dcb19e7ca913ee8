//! Fault isolation for calls to remote dependencies.

pub mod circuit_breaker;
pub mod client;
pub mod registry;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitError};
pub use client::{ClientError, ResilientClient};
pub use registry::BreakerRegistry;
