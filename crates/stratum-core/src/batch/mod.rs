//! Adaptive request aggregation.

pub mod handler;
pub mod processor;

pub use handler::{BatchHandler, BatchResults};
pub use processor::{BatchError, BatchOptions, BatchProcessor, BatchTicket};
