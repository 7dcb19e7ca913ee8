//! Resilient orchestration runtime for Stratum.
//!
//! Components, each usable on its own:
//! - `workflow` -- dependency-ordered step execution with retry, timeout and abort
//! - `resilience` -- circuit breakers and the pool + breaker client
//! - `pool` -- bounded connection pool with maintenance
//! - `batch` -- adaptive batch processor
//! - `cache` -- in-process LRU/TTL tier and the tiered cache
//!
//! `registry::RuntimeRegistry` wires them to one config and event bus. This
//! crate performs no I/O itself; adapters plug in through
//! `ConnectionFactory`, `BatchHandler`, `CacheTier` and `StepHandler`.

pub mod batch;
pub mod cache;
pub mod event;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod workflow;

pub use registry::{ComponentKind, ManagedComponent, RegistryError, RuntimeRegistry};
