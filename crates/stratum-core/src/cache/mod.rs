//! Tiered result cache.

pub mod memory;
pub mod tier;
pub mod tiered;

pub use memory::MemoryCache;
pub use tier::{BoxCacheTier, CacheError, CacheTier, CacheTierDyn, CacheValue};
pub use tiered::TieredCache;
