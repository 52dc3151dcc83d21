//! The event bus.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{error, info};

use fleet_core::FleetEvent;

/// Observer callback. Errors are logged, never propagated.
pub type EventHandler = Arc<dyn Fn(&FleetEvent) -> anyhow::Result<()> + Send + Sync>;

struct Inner {
    /// Registered handlers keyed by subscription id (ids are monotonic).
    handlers: DashMap<u64, EventHandler>,
    next_id: AtomicU64,
}

/// Cloneable handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default logging subscriber installed.
    pub fn new() -> Self {
        let bus = Self::bare();
        // Log lines are high volume and already carry their own output path.
        let logger = bus.subscribe(|event| {
            if event.as_log().is_none() {
                info!(server_id = %event.server_id(), kind = event.kind(), "{event}");
            }
            Ok(())
        });
        logger.detach();
        bus
    }

    /// Create a bus with no subscribers at all.
    pub fn bare() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver `event` to every current subscriber and hand it back.
    pub fn publish(&self, event: impl Into<FleetEvent>) -> FleetEvent {
        let event = event.into();

        // Snapshot first so handlers may (un)subscribe without deadlocking a shard.
        let mut handlers: Vec<(u64, EventHandler)> = self
            .inner
            .handlers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        subscriber = id,
                        kind = event.kind(),
                        error = %e,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    error!(subscriber = id, kind = event.kind(), "event handler panicked");
                }
            }
        }

        event
    }

    /// Register a handler. Dropping the returned `Subscription` keeps the
    /// handler registered; call `unsubscribe` to remove it.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&FleetEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.insert(id, Arc::new(handler));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.len()
    }
}

/// Handle returned by `EventBus::subscribe`.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    bus: Weak<Inner>,
}

impl Subscription {
    /// Remove the handler. Safe to call after the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.handlers.remove(&self.id);
        }
    }

    /// Give up the ability to unsubscribe; the handler lives as long as the bus.
    pub fn detach(self) {}
}
