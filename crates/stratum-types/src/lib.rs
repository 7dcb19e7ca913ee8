//! Shared domain types for Stratum.
//!
//! This crate contains the plain data shared across the runtime: the error
//! taxonomy, configuration knobs, workflow results and reports, component
//! status snapshots, and bus events.
//!
//! No async or I/O dependencies -- only serde (+ JSON/YAML), uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod workflow;
