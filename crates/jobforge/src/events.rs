//! The in-process Event Bus (C9, §4.7).
//!
//! `tokio::sync::broadcast` already gives us the guarantees the spec asks
//! for: at-most-once delivery to each subscriber, fan-out to an arbitrary
//! number of receivers, and the subscriber list's own lock behind a mutex
//! internal to the channel — no extra locking needed here.

use tokio::sync::broadcast;

use crate::types::JobEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of lifecycle events to in-process observers (logging, metrics,
/// dashboards). Cross-process propagation is a separate concern, handled by
/// publishing the same event through `Kv::publish_event` (see `Engine`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Emits an event to every current subscriber. A subscriber lagging far
    /// enough behind to miss this doesn't block the emitter — that's the
    /// at-most-once semantics the spec calls for (§4.7).
    pub fn emit(&self, event: JobEvent) {
        // No subscribers is not an error: observability is optional.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
