//! Workflow engine: dependency-ordered step execution over a shared context.
//!
//! - `context` -- shared run state, step outputs and template resolution
//! - `step` -- step builder, `StepHandler` trait and `StepError`
//! - `retry` -- per-step retry policy with backoff
//! - `dag` -- graph validation with cycle path reporting
//! - `engine` -- ready-queue scheduler with concurrency bound and abort
//! - `composite` -- `ParallelGroup` step running children concurrently

pub mod composite;
pub mod context;
pub mod dag;
pub mod engine;
pub mod retry;
pub mod step;

pub use composite::ParallelGroup;
pub use context::{ContextError, WorkflowContext};
pub use dag::validate_steps;
pub use engine::{WorkflowEngine, WorkflowError};
pub use retry::RetryPolicy;
pub use step::{FnStep, SkipPredicate, Step, StepError, StepHandler, StepHandlerDyn};
