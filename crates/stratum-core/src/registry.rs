//! Composition root for a runtime instance.
//!
//! `RuntimeRegistry` owns the shared pieces every component needs (config,
//! event bus, circuit breakers) and keeps named pools, batch processors and
//! caches so other parts of the application can look them up by name and
//! concrete type. Nothing here is global: tests and embedders create as
//! many registries as they like.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stratum_types::config::RuntimeConfig;
use stratum_types::error::{ConfigError, ErrorKind, HasErrorKind};

use crate::batch::{BatchError, BatchHandler, BatchOptions, BatchProcessor};
use crate::cache::{CacheValue, MemoryCache, TieredCache};
use crate::event::EventBus;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolError};
use crate::resilience::{BreakerRegistry, CircuitBreaker};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("component '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

impl HasErrorKind for RegistryError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyRegistered(_) => ErrorKind::AlreadyExists,
            Self::Config(e) => e.error_kind(),
            Self::Pool(e) => e.error_kind(),
            Self::Batch(e) => e.error_kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Pool,
    BatchProcessor,
    Cache,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pool => "pool",
            Self::BatchProcessor => "batch_processor",
            Self::Cache => "cache",
        })
    }
}

type ShutdownFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A long-lived component the registry can stop.
pub trait ManagedComponent: Any + Send + Sync {
    fn kind(&self) -> ComponentKind;

    /// Stop background work and release held resources.
    fn shutdown(&self) -> ShutdownFuture<'_>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<F: ConnectionFactory> ManagedComponent for ConnectionPool<F> {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Pool
    }

    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(self.close())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<H: BatchHandler> ManagedComponent for BatchProcessor<H> {
    fn kind(&self) -> ComponentKind {
        ComponentKind::BatchProcessor
    }

    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(self.stop())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<V: CacheValue> ManagedComponent for MemoryCache<V> {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Cache
    }

    fn shutdown(&self) -> ShutdownFuture<'_> {
        self.stop();
        Box::pin(std::future::ready(()))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<V: CacheValue> ManagedComponent for TieredCache<V> {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Cache
    }

    /// Tiers own their background work; register them separately to stop it.
    fn shutdown(&self) -> ShutdownFuture<'_> {
        Box::pin(std::future::ready(()))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Explicit runtime context: config, event bus, breakers and named components.
pub struct RuntimeRegistry {
    config: Arc<RuntimeConfig>,
    event_bus: EventBus,
    breakers: BreakerRegistry,
    components: DashMap<String, Arc<dyn ManagedComponent>>,
}

impl RuntimeRegistry {
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        Self::with_event_bus(config, EventBus::default())
    }

    pub fn with_event_bus(config: RuntimeConfig, event_bus: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            breakers: BreakerRegistry::new(Arc::clone(&config)).with_event_bus(event_bus.clone()),
            config,
            event_bus,
            components: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Breaker for a dependency, created on first use.
    pub fn breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, ConfigError> {
        self.breakers.get_or_create(name)
    }

    /// Register a component under `name`. Names are unique across kinds.
    pub fn register<T: ManagedComponent>(&self, name: &str, component: T) -> Result<Arc<T>, RegistryError> {
        self.register_arc(name, Arc::new(component))
    }

    pub fn register_arc<T: ManagedComponent>(
        &self,
        name: &str,
        component: Arc<T>,
    ) -> Result<Arc<T>, RegistryError> {
        match self.components.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(name.to_string())),
            Entry::Vacant(slot) => {
                tracing::debug!(component = name, kind = %component.kind(), "registered component");
                slot.insert(Arc::clone(&component) as Arc<dyn ManagedComponent>);
                Ok(component)
            }
        }
    }

    /// Component `name`, if registered with concrete type `T`.
    pub fn get<T: ManagedComponent>(&self, name: &str) -> Option<Arc<T>> {
        let component = self.components.get(name).map(|r| Arc::clone(r.value()))?;
        component.into_any().downcast::<T>().ok()
    }

    /// Unregister without stopping.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn ManagedComponent>> {
        self.components.remove(name).map(|(_, c)| c)
    }

    /// Registered names with their kind, sorted by name.
    pub fn components(&self) -> Vec<(String, ComponentKind)> {
        let mut list: Vec<(String, ComponentKind)> = self
            .components
            .iter()
            .map(|r| (r.key().clone(), r.value().kind()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    // -- builders using the registry's config -------------------------------

    /// Reserve `name` and register what `build` produces. The name stays
    /// locked while `build` runs, so `build` must not block.
    fn register_with<T: ManagedComponent>(
        &self,
        name: &str,
        build: impl FnOnce() -> Result<Arc<T>, RegistryError>,
    ) -> Result<Arc<T>, RegistryError> {
        match self.components.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(name.to_string())),
            Entry::Vacant(slot) => {
                let component = build()?;
                tracing::debug!(component = name, kind = %component.kind(), "registered component");
                slot.insert(Arc::clone(&component) as Arc<dyn ManagedComponent>);
                Ok(component)
            }
        }
    }

    /// Open a pool with the configured `[pool]` settings, start its
    /// maintenance task and register it.
    ///
    /// Opening awaits the factory, so the name cannot be held meanwhile. If
    /// another caller registers the same name first, this pool is closed
    /// again before `AlreadyRegistered` is returned.
    pub async fn create_pool<F: ConnectionFactory>(
        &self,
        name: &str,
        factory: F,
    ) -> Result<Arc<ConnectionPool<F>>, RegistryError> {
        if self.components.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        let pool = Arc::new(ConnectionPool::start(name, self.config.pool.clone(), factory).await?);
        match self.register_arc(name, Arc::clone(&pool)) {
            Ok(pool) => Ok(pool),
            Err(err) => {
                tracing::debug!(component = name, "lost registration race, closing pool");
                pool.close().await;
                Err(err)
            }
        }
    }

    /// Start a batch processor with the configured `[batch]` settings. When
    /// `breaker` is given, every batch call goes through that named breaker.
    pub fn start_batch_processor<H: BatchHandler>(
        &self,
        name: &str,
        handler: H,
        breaker: Option<&str>,
    ) -> Result<Arc<BatchProcessor<H>>, RegistryError> {
        let breaker = breaker.map(|b| self.breaker(b)).transpose()?;
        self.register_with(name, || {
            let options = BatchOptions {
                breaker,
                event_bus: Some(self.event_bus.clone()),
            };
            let processor = BatchProcessor::start_with(name, self.config.batch.clone(), handler, options)?;
            Ok(Arc::new(processor))
        })
    }

    /// In-process cache with the configured `[cache]` settings and a running
    /// expiry sweeper.
    pub fn memory_cache<V: CacheValue>(&self, name: &str) -> Result<Arc<MemoryCache<V>>, RegistryError> {
        self.register_with(name, || {
            let cache = Arc::new(MemoryCache::new(name, &self.config.cache)?);
            cache.start_sweeper();
            Ok(cache)
        })
    }

    /// Stop and unregister every component.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.components.iter().map(|r| r.key().clone()).collect();
        for name in names {
            if let Some((_, component)) = self.components.remove(&name) {
                component.shutdown().await;
                tracing::debug!(component = name.as_str(), "component stopped");
            }
        }
        tracing::info!("runtime registry shut down");
    }
}

impl fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("breakers", &self.breakers.len())
            .field("components", &self.components.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use stratum_types::error::AdapterError;

    use super::*;
    use crate::batch::BatchResults;

    #[derive(Default)]
    struct Counter {
        next: AtomicU64,
    }

    impl ConnectionFactory for Counter {
        type Connection = u64;

        async fn create(&self) -> Result<u64, AdapterError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct Upper;

    impl BatchHandler for Upper {
        type Item = String;
        type Output = String;

        async fn process(&self, items: &[String]) -> Result<BatchResults<String>, AdapterError> {
            Ok(items
                .iter()
                .enumerate()
                .map(|(i, s)| (i, Ok(s.to_uppercase())))
                .collect::<HashMap<_, _>>())
        }
    }

    fn registry() -> RuntimeRegistry {
        RuntimeRegistry::new(RuntimeConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_components_retrievable_by_type() {
        let registry = registry();
        let pool = registry.create_pool("secrets", Counter::default()).await.unwrap();
        registry.memory_cache::<String>("l1").unwrap();

        let found = registry.get::<ConnectionPool<Counter>>("secrets").unwrap();
        assert_eq!(found.name(), pool.name());
        // Wrong type or unknown name.
        assert!(registry.get::<MemoryCache<u32>>("l1").is_none());
        assert!(registry.get::<MemoryCache<String>>("missing").is_none());
        assert!(registry.get::<MemoryCache<String>>("l1").is_some());

        assert_eq!(
            registry.components(),
            vec![
                ("l1".to_string(), ComponentKind::Cache),
                ("secrets".to_string(), ComponentKind::Pool),
            ]
        );
        registry.shutdown().await;
        assert!(pool.is_closed());
        assert!(registry.components().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let registry = registry();
        registry.memory_cache::<String>("shared").unwrap();
        let err = registry.create_pool("shared", Counter::default()).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
        assert_eq!(err.error_kind(), ErrorKind::AlreadyExists);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_processor_uses_named_breaker() {
        let registry = registry();
        let processor = registry
            .start_batch_processor("upper", Upper, Some("document-db"))
            .unwrap();
        assert!(registry.breakers().get("document-db").is_some());

        let ticket = processor.add_item("abc".to_string()).unwrap();
        processor.flush();
        assert_eq!(ticket.await.unwrap(), "ABC");

        registry.shutdown().await;
        assert!(processor.is_stopped());
    }

    /// Yields before every open so concurrent callers interleave.
    #[derive(Clone, Default)]
    struct Tracked {
        opened: Arc<AtomicU64>,
        closed: Arc<AtomicU64>,
    }

    impl ConnectionFactory for Tracked {
        type Connection = ();

        async fn create(&self) -> Result<(), AdapterError> {
            tokio::task::yield_now().await;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self, _conn: ()) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_racing_pool_creation_closes_the_loser() {
        let registry = registry();
        let factory = Tracked::default();

        let (first, second) = tokio::join!(
            registry.create_pool("secret-store", factory.clone()),
            registry.create_pool("secret-store", factory.clone()),
        );
        let (winner, loser) = match (first, second) {
            (Ok(pool), Err(err)) | (Err(err), Ok(pool)) => (pool, err),
            _ => panic!("exactly one creator should win"),
        };
        assert!(matches!(loser, RegistryError::AlreadyRegistered(_)));
        assert!(!winner.is_closed());

        // Each pool opened min_size connections; only the loser's were closed.
        let min_size = registry.config().pool.min_size as u64;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2 * min_size);
        assert_eq!(factory.closed.load(Ordering::SeqCst), min_size);
        assert_eq!(registry.components().len(), 1);

        registry.shutdown().await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2 * min_size);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RuntimeConfig::default();
        config.pool.max_size = 0;
        assert!(RuntimeRegistry::new(config).is_err());
    }
}
