//! In-process cache tier: bounded map with LRU eviction and TTL expiry.
//!
//! Recency is tracked with a monotonically increasing tick per access and a
//! `BTreeMap<tick, key>`, so the least-recently-used key is always the first
//! entry of the map. Expired entries are dropped lazily on read and by a
//! periodic sweep.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use stratum_types::config::CacheConfig;
use stratum_types::error::ConfigError;
use stratum_types::status::CacheStats;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::tier::{CacheError, CacheTier, CacheValue};

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Option<Duration>,
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) > ttl)
    }
}

struct MemoryState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> MemoryState<V> {
    fn next_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Single-tier in-process cache.
pub struct MemoryCache<V> {
    name: String,
    max_size: usize,
    default_ttl: Option<Duration>,
    sweep_interval: Duration,
    state: Mutex<MemoryState<V>>,
    shutdown: CancellationToken,
}

impl<V: CacheValue> MemoryCache<V> {
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            max_size: config.max_size,
            default_ttl: config.default_ttl(),
            sweep_interval: config.sweep_interval(),
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState<V>> {
        self.state.lock().expect("memory cache lock poisoned")
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get_value(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.lock_state();
        let st = &mut *guard;

        let expired = match st.entries.get(key) {
            None => {
                st.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            st.remove(key);
            st.expirations += 1;
            st.misses += 1;
            return None;
        }

        let tick = st.next_tick();
        let entry = st.entries.get_mut(key)?;
        st.recency.remove(&entry.tick);
        st.recency.insert(tick, key.to_string());
        entry.tick = tick;
        entry.last_accessed = now;
        entry.access_count += 1;
        st.hits += 1;
        Some(entry.value.clone())
    }

    /// Insert or replace `key`. At capacity, the least-recently-used entry
    /// is evicted first.
    pub fn set_value(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.or(self.default_ttl);
        let mut guard = self.lock_state();
        let st = &mut *guard;

        let replaced = st.remove(key).is_some();
        if !replaced && st.entries.len() >= self.max_size {
            if let Some(evicted) = st.evict_lru() {
                tracing::debug!(cache = self.name.as_str(), key = evicted.as_str(), "evicted lru entry");
            }
        }

        let tick = st.next_tick();
        st.recency.insert(tick, key.to_string());
        st.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                ttl,
                tick,
            },
        );
    }

    pub fn delete_value(&self, key: &str) -> bool {
        self.lock_state().remove(key).is_some()
    }

    pub fn clear_all(&self) {
        let mut st = self.lock_state();
        st.entries.clear();
        st.recency.clear();
    }

    /// Whether `key` holds a live entry. Does not touch recency or stats.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock_state()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times `key` was read since it was set, if present.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.lock_state().entries.get(key).map(|e| e.access_count)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let expired: Vec<String> = st
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            st.remove(key);
        }
        st.expirations += expired.len() as u64;
        expired.len()
    }

    /// Spawn the periodic expiry sweep. Stops on [`stop`](Self::stop) or
    /// when the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = weak.upgrade() else { break };
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(cache = cache.name.as_str(), removed, "swept expired entries");
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<V: CacheValue> CacheTier<V> for MemoryCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        Ok(self.get_value(key))
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.set_value(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.delete_value(key))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.clear_all();
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set_value(&key, value, ttl);
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let st = self.lock_state();
        CacheStats {
            name: self.name.clone(),
            size: st.entries.len(),
            max_size: self.max_size,
            hits: st.hits,
            misses: st.misses,
            evictions: st.evictions,
            expirations: st.expirations,
        }
    }
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .finish()
    }
}
