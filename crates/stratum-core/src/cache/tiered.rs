//! Multi-tier cache with read-through promotion.
//!
//! Tiers are ordered fastest first. `get` returns the first hit and back-fills
//! it into every faster tier that missed. Writes go to every tier or only the
//! fastest one, per [`WritePolicy`]. All writes (including promotions) are
//! serialized by one async lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stratum_types::config::{CacheConfig, WritePolicy};
use stratum_types::error::{AdapterError, ConfigError};
use stratum_types::status::CacheStats;
use tokio::sync::Mutex;

use super::tier::{BoxCacheTier, CacheError, CacheTier, CacheValue};

pub struct TieredCache<V: CacheValue> {
    name: String,
    tiers: Vec<BoxCacheTier<V>>,
    write_policy: WritePolicy,
    promotion_ttl: Option<Duration>,
    write_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: CacheValue> TieredCache<V> {
    /// `tiers` must be non-empty and ordered fastest first.
    pub fn new(
        name: impl Into<String>,
        tiers: Vec<BoxCacheTier<V>>,
        config: &CacheConfig,
    ) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::invalid("cache", "a tiered cache needs at least one tier"));
        }
        Ok(Self {
            name: name.into(),
            tiers,
            write_policy: config.write_policy,
            promotion_ttl: config.promotion_ttl(),
            write_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn tiers(&self) -> &[BoxCacheTier<V>] {
        &self.tiers
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    /// Tiers a write goes to under the configured policy.
    fn write_targets(&self) -> &[BoxCacheTier<V>] {
        match self.write_policy {
            WritePolicy::WriteThrough => &self.tiers,
            WritePolicy::FastestOnly => &self.tiers[..1],
        }
    }

    async fn promote(&self, key: &str, value: &V, found_at: usize) {
        let _guard = self.write_lock.lock().await;
        for tier in &self.tiers[..found_at] {
            if let Err(e) = tier.set(key, value.clone(), self.promotion_ttl).await {
                tracing::warn!(
                    cache = self.name.as_str(),
                    tier = tier.name(),
                    error = %e,
                    "failed to promote entry"
                );
            }
        }
    }

    /// Return the cached value or compute, store and return it.
    pub async fn get_or_load<Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        load: impl FnOnce() -> Fut,
    ) -> Result<V, CacheError>
    where
        Fut: Future<Output = Result<V, AdapterError>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let value = load().await.map_err(|source| CacheError::Load {
            key: key.to_string(),
            source,
        })?;
        self.set(key, value.clone(), ttl).await?;
        Ok(value)
    }

    pub async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Stats for every tier, fastest first.
    pub fn tier_stats(&self) -> Vec<CacheStats> {
        self.tiers.iter().map(|t| t.stats()).collect()
    }
}

impl<V: CacheValue> CacheTier<V> for TieredCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Failing tiers are logged and skipped; the error only surfaces if no
    /// tier could answer.
    async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let mut last_error = None;
        let mut answered = false;

        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(value)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    if idx > 0 {
                        self.promote(key, &value, idx).await;
                    }
                    return Ok(Some(value));
                }
                Ok(None) => answered = true,
                Err(e) => {
                    tracing::warn!(
                        cache = self.name.as_str(),
                        tier = tier.name(),
                        error = %e,
                        "cache tier read failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut first_error = None;
        for tier in self.write_targets() {
            if let Err(e) = tier.set(key, value.clone(), ttl).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut deleted = false;
        let mut first_error = None;
        for tier in &self.tiers {
            match tier.delete(key).await {
                Ok(found) => deleted |= found,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(deleted), Err)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut first_error = None;
        for tier in &self.tiers {
            if let Err(e) = tier.clear().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Each tier is asked only for the keys every faster tier missed.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, V>, CacheError> {
        let mut found: HashMap<String, V> = HashMap::new();
        let mut remaining: Vec<String> = keys.to_vec();

        for (idx, tier) in self.tiers.iter().enumerate() {
            if remaining.is_empty() {
                break;
            }
            let hits = match tier.get_many(&remaining).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(
                        cache = self.name.as_str(),
                        tier = tier.name(),
                        error = %e,
                        "cache tier batch read failed"
                    );
                    continue;
                }
            };
            if hits.is_empty() {
                continue;
            }

            if idx > 0 {
                let promoted: Vec<(String, V)> =
                    hits.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let _guard = self.write_lock.lock().await;
                for faster in &self.tiers[..idx] {
                    if let Err(e) = faster.set_many(promoted.clone(), self.promotion_ttl).await {
                        tracing::warn!(
                            cache = self.name.as_str(),
                            tier = faster.name(),
                            error = %e,
                            "failed to promote entries"
                        );
                    }
                }
            }

            remaining.retain(|k| !hits.contains_key(k));
            found.extend(hits);
        }

        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(remaining.len() as u64, Ordering::Relaxed);
        Ok(found)
    }

    async fn set_many(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut first_error = None;
        for tier in self.write_targets() {
            if let Err(e) = tier.set_many(entries.clone(), ttl).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Hits and misses are counted at this level; size and eviction counts
    /// come from the fastest tier.
    fn stats(&self) -> CacheStats {
        let fastest = self.tiers[0].stats();
        CacheStats {
            name: self.name.clone(),
            size: fastest.size,
            max_size: fastest.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: fastest.evictions,
            expirations: fastest.expirations,
        }
    }
}

impl<V: CacheValue> std::fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.name)
            .field("tiers", &self.tiers)
            .field("write_policy", &self.write_policy)
            .finish()
    }
}
