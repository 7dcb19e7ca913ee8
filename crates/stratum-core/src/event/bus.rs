//! Runtime event fan-out.
//!
//! The engine, every circuit breaker and every batch processor created by a
//! `RuntimeRegistry` publish into one shared bus. Observers (progress
//! reporters, audit writers, tests) subscribe and see events in publish
//! order. Slow observers lose the oldest events rather than stalling the
//! publishers.

use stratum_types::event::RuntimeEvent;
use tokio::sync::broadcast;

/// Capacity of `EventBus::default()`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Shared channel for [`RuntimeEvent`]s. Clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Send `event` to every current observer. Never blocks and never fails;
    /// with nobody subscribed the event is dropped.
    pub fn publish(&self, event: RuntimeEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("runtime event dropped, no observers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
