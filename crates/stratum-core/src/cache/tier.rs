//! CacheTier trait and its object-safe wrapper.
//!
//! Follows the same blanket-impl pattern as the other boxed traits:
//! 1. `CacheTier<V>` uses RPITIT async methods
//! 2. `CacheTierDyn<V>` mirrors it with boxed futures and is blanket-implemented
//! 3. `BoxCacheTier<V>` wraps `Box<dyn CacheTierDyn<V>>` so a tiered cache can
//!    mix in-process and remote tiers

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use stratum_types::error::{AdapterError, ErrorKind, HasErrorKind};
use stratum_types::status::CacheStats;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A tier's backing store failed.
    #[error("cache tier '{tier}' failed")]
    Tier {
        tier: String,
        #[source]
        source: AdapterError,
    },

    /// `get_or_load` could not produce the value.
    #[error("failed to load value for key '{key}'")]
    Load {
        key: String,
        #[source]
        source: AdapterError,
    },
}

impl HasErrorKind for CacheError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Tier { source, .. } | Self::Load { source, .. } => source.error_kind(),
        }
    }
}

/// Values a cache can hold.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// One level of a cache (in-process map, shared remote store, ...).
///
/// `ttl = None` on `set` means "use the tier's default".
pub trait CacheTier<V: CacheValue>: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<V>, CacheError>> + Send;

    fn set(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Returns whether the key was present.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    fn clear(&self) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Look up several keys; missing keys are absent from the map.
    fn get_many(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, V>, CacheError>> + Send {
        async move {
            let results = join_all(keys.iter().map(|key| self.get(key))).await;
            let mut found = HashMap::new();
            for (key, result) in keys.iter().zip(results) {
                if let Some(value) = result? {
                    found.insert(key.clone(), value);
                }
            }
            Ok(found)
        }
    }

    fn set_many(
        &self,
        entries: Vec<(String, V)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send {
        async move {
            let results = join_all(
                entries
                    .into_iter()
                    .map(|(key, value)| async move { self.set(&key, value, ttl).await }),
            )
            .await;
            results.into_iter().collect()
        }
    }

    fn stats(&self) -> CacheStats;
}

impl<V: CacheValue, T: CacheTier<V>> CacheTier<V> for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<V>, CacheError>> + Send {
        (**self).get(key)
    }

    fn set(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, CacheError>> + Send {
        (**self).delete(key)
    }

    fn clear(&self) -> impl Future<Output = Result<(), CacheError>> + Send {
        (**self).clear()
    }

    fn get_many(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<HashMap<String, V>, CacheError>> + Send {
        (**self).get_many(keys)
    }

    fn set_many(
        &self,
        entries: Vec<(String, V)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send {
        (**self).set_many(entries, ttl)
    }

    fn stats(&self) -> CacheStats {
        (**self).stats()
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Object-safe version of [`CacheTier`] with boxed futures.
pub trait CacheTierDyn<V: CacheValue>: Send + Sync {
    fn name(&self) -> &str;
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Option<V>>;
    fn set_boxed<'a>(&'a self, key: &'a str, value: V, ttl: Option<Duration>) -> BoxFut<'a, ()>;
    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, bool>;
    fn clear_boxed(&self) -> BoxFut<'_, ()>;
    fn get_many_boxed<'a>(&'a self, keys: &'a [String]) -> BoxFut<'a, HashMap<String, V>>;
    fn set_many_boxed(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> BoxFut<'_, ()>;
    fn stats(&self) -> CacheStats;
}

impl<V: CacheValue, T: CacheTier<V>> CacheTierDyn<V> for T {
    fn name(&self) -> &str {
        CacheTier::name(self)
    }

    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Option<V>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(&'a self, key: &'a str, value: V, ttl: Option<Duration>) -> BoxFut<'a, ()> {
        Box::pin(self.set(key, value, ttl))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, bool> {
        Box::pin(self.delete(key))
    }

    fn clear_boxed(&self) -> BoxFut<'_, ()> {
        Box::pin(self.clear())
    }

    fn get_many_boxed<'a>(&'a self, keys: &'a [String]) -> BoxFut<'a, HashMap<String, V>> {
        Box::pin(self.get_many(keys))
    }

    fn set_many_boxed(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> BoxFut<'_, ()> {
        Box::pin(self.set_many(entries, ttl))
    }

    fn stats(&self) -> CacheStats {
        CacheTier::stats(self)
    }
}

/// Type-erased cache tier.
pub struct BoxCacheTier<V: CacheValue> {
    inner: Box<dyn CacheTierDyn<V>>,
}

impl<V: CacheValue> BoxCacheTier<V> {
    pub fn new<T: CacheTier<V>>(tier: T) -> Self {
        Self {
            inner: Box::new(tier),
        }
    }
}

impl<V: CacheValue> CacheTier<V> for BoxCacheTier<V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        self.inner.get_boxed(key).await
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner.set_boxed(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.delete_boxed(key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear_boxed().await
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, V>, CacheError> {
        self.inner.get_many_boxed(keys).await
    }

    async fn set_many(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner.set_many_boxed(entries, ttl).await
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<V: CacheValue> std::fmt::Debug for BoxCacheTier<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCacheTier")
            .field("name", &self.inner.name())
            .finish()
    }
}
