//! Named circuit breakers shared across the runtime.
//!
//! Every adapter that talks to the same dependency must see the same breaker,
//! so breakers are created once per name and handed out as `Arc`s.

use std::sync::Arc;

use dashmap::DashMap;
use stratum_types::config::RuntimeConfig;
use stratum_types::error::ConfigError;
use stratum_types::status::CircuitStatusInfo;

use super::circuit_breaker::CircuitBreaker;
use crate::event::EventBus;

/// Get-or-create map of breakers keyed by dependency name.
///
/// Breaker configuration comes from `RuntimeConfig::breaker_config`, so a
/// `[breakers.<name>]` section overrides the shared defaults for that name.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    config: Arc<RuntimeConfig>,
    event_bus: Option<EventBus>,
}

impl BreakerRegistry {
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<CircuitBreaker>, ConfigError> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let mut breaker = CircuitBreaker::new(name, self.config.breaker_config(name))?;
        if let Some(bus) = &self.event_bus {
            breaker = breaker.with_event_bus(bus.clone());
        }

        // Another caller may have raced us; the entry API keeps the first one.
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(breaker));
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Status of every registered breaker, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitStatusInfo> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|r| Arc::clone(r.value())).collect();
        let mut statuses: Vec<CircuitStatusInfo> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Close every breaker.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
