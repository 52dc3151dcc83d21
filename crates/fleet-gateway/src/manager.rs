//! Gateway connection manager: at most one live client per server.
//!
//! The cache holds the *construction* of a client, not just a finished
//! one: `of()` callers arriving while the event subscription is still
//! opening all await the same shared future. Each slot carries a
//! generation so a finished subscription only evicts its own slot, never
//! one recreated after it.
//!
//! A slot opened through `attach()` is bound to one container. Eviction
//! hands that container to the unreachable handler, so tearing down a dead
//! connection never touches a container created after it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use fleet_core::{GatewaySettings, ServerId, StopEvent};
use fleet_events::EventBus;

use crate::client::GatewayClient;
use crate::error::{GatewayError, GatewayResult};
use crate::registry;
use crate::sse::{SseItem, SseMessage};
use crate::transport::{GatewayTransport, Target};

/// Pending or finished construction of a client.
pub type Connecting = Shared<BoxFuture<'static, GatewayResult<GatewayClient>>>;

/// Called with the evicted connection's target once a server's event
/// stream is gone for good.
pub type UnreachableHandler = Arc<dyn Fn(Target) -> BoxFuture<'static, ()> + Send + Sync>;

/// Stop reason published when an instance stops answering.
pub const UNREACHABLE_REASON: &str = "event-fetch timeout";

struct Slot {
    generation: u64,
    client: GatewayClient,
    ready: Connecting,
    task: AbortHandle,
}

struct Inner {
    transport: Arc<dyn GatewayTransport>,
    bus: EventBus,
    settings: GatewaySettings,
    slots: DashMap<ServerId, Slot>,
    generation: AtomicU64,
    on_unreachable: Option<UnreachableHandler>,
}

/// Caches one `GatewayClient` per server identity.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<Inner>,
}

impl GatewayManager {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        bus: EventBus,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                bus,
                settings,
                slots: DashMap::new(),
                generation: AtomicU64::new(0),
                on_unreachable: None,
            }),
        }
    }

    /// Run `handler` after a server's subscription failed permanently or
    /// ended, typically to remove the container.
    ///
    /// Must be called before the manager is cloned.
    pub fn with_unreachable_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Target) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: UnreachableHandler = Arc::new(move |target| handler(target).boxed());
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.on_unreachable = Some(handler),
            None => warn!("unreachable handler ignored: manager already shared"),
        }
        self
    }

    /// The established client for `id`, constructing it on first use.
    ///
    /// Resolves once the first event arrives from the instance.
    pub fn of(&self, id: ServerId) -> Connecting {
        self.slot(id).1
    }

    /// The client for `id`, whether or not its event stream is established.
    /// Must be called from within a tokio runtime.
    pub fn client(&self, id: ServerId) -> GatewayClient {
        self.slot(id).0
    }

    /// Drop the connection to `id` without touching the instance.
    pub fn cancel(&self, id: ServerId) -> bool {
        match self.inner.slots.remove(&id) {
            Some((_, slot)) => {
                slot.task.abort();
                debug!(server_id = %id, "gateway connection cancelled");
                true
            }
            None => false,
        }
    }

    /// Identities with a cached connection.
    pub fn connected(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.inner.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Cancel every connection.
    pub fn shutdown(&self) {
        for id in self.connected() {
            self.cancel(id);
        }
    }

    /// The client for `id` bound to `container`.
    ///
    /// A cached connection opened against any other container is replaced
    /// without eviction side effects.
    pub fn attach(&self, id: ServerId, container: &str) -> GatewayClient {
        match self.inner.slots.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().client.target().container.as_deref() == Some(container) {
                    return occupied.get().client.clone();
                }
                let slot = self.open(Target::for_container(id, container));
                let client = slot.client.clone();
                let stale = occupied.insert(slot);
                stale.task.abort();
                debug!(server_id = %id, %container, "gateway connection rebound");
                client
            }
            Entry::Vacant(vacant) => {
                let slot = self.open(Target::for_container(id, container));
                let client = slot.client.clone();
                vacant.insert(slot);
                client
            }
        }
    }

    /// Container the cached connection of `id` is bound to.
    pub fn container_of(&self, id: ServerId) -> Option<String> {
        self.inner
            .slots
            .get(&id)
            .and_then(|slot| slot.client.target().container.clone())
    }

    fn slot(&self, id: ServerId) -> (GatewayClient, Connecting) {
        match self.inner.slots.entry(id) {
            Entry::Occupied(slot) => {
                let slot = slot.get();
                (slot.client.clone(), slot.ready.clone())
            }
            Entry::Vacant(vacant) => {
                let slot = self.open(Target::new(id));
                let pair = (slot.client.clone(), slot.ready.clone());
                vacant.insert(slot);
                pair
            }
        }
    }

    /// Start the subscription task for a new slot. The caller inserts it.
    fn open(&self, target: Target) -> Slot {
        let id = target.server_id;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let client =
            GatewayClient::new(target, self.inner.transport.clone(), &self.inner.settings);

        let (tx, rx) = oneshot::channel();
        let ready: Connecting = rx
            .map(|r| r.unwrap_or(Err(GatewayError::Cancelled)))
            .boxed()
            .shared();

        let task = tokio::spawn(subscribe(self.inner.clone(), client.clone(), generation, tx));
        info!(server_id = %id, "gateway connection opening");

        Slot {
            generation,
            client,
            ready,
            task: task.abort_handle(),
        }
    }
}

/// Own the event subscription of one client until it fails for good.
async fn subscribe(
    inner: Arc<Inner>,
    client: GatewayClient,
    generation: u64,
    ready: oneshot::Sender<GatewayResult<GatewayClient>>,
) {
    let id = client.server_id();
    let mut ready = Some(ready);
    let outcome = consume(&inner, &client, &mut ready).await;

    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(outcome.clone().err().unwrap_or(GatewayError::Closed)));
    }

    let evicted = inner
        .slots
        .remove_if(&id, |_, slot| slot.generation == generation)
        .is_some();
    if !evicted {
        return;
    }

    match &outcome {
        Ok(()) => info!(server_id = %id, "gateway event stream ended"),
        Err(e) => warn!(server_id = %id, error = %e, "gateway unreachable, giving up"),
    }
    inner.bus.publish(StopEvent::new(id, UNREACHABLE_REASON));
    if let Some(handler) = &inner.on_unreachable {
        handler(client.target().clone()).await;
    }
}

/// Read events with bounded retries. `Ok` on a normal end of stream.
async fn consume(
    inner: &Inner,
    client: &GatewayClient,
    ready: &mut Option<oneshot::Sender<GatewayResult<GatewayClient>>>,
) -> GatewayResult<()> {
    let id = client.server_id();
    let settings = &inner.settings;
    let mut failures = 0u32;

    loop {
        let mut events = inner.transport.events(client.target());
        let result = loop {
            match tokio::time::timeout(settings.idle_timeout, events.next()).await {
                Err(_) => {
                    break Err(GatewayError::BadRequest(format!(
                        "no event within {:?}",
                        settings.idle_timeout
                    )));
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(SseItem::Comment(_)))) => {}
                Ok(Some(Ok(SseItem::Message(message)))) => {
                    failures = 0;
                    dispatch(&inner.bus, id, &message);
                    if let Some(tx) = ready.take() {
                        debug!(server_id = %id, "gateway connection established");
                        let _ = tx.send(Ok(client.clone()));
                    }
                }
            }
        };
        drop(events);

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                failures += 1;
                if failures >= settings.retry_attempts {
                    return Err(e);
                }
                debug!(
                    server_id = %id,
                    attempt = failures,
                    error = %e,
                    "gateway subscription failed, retrying"
                );
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}

fn dispatch(bus: &EventBus, id: ServerId, message: &SseMessage) {
    match registry::parse(id, &message.event, &message.data) {
        Ok(Some(event)) => {
            bus.publish(event);
        }
        Ok(None) => {
            debug!(server_id = %id, kind = %message.event, "dropping unknown event kind");
        }
        Err(e) => {
            warn!(server_id = %id, kind = %message.event, error = %e, "dropping malformed event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use fleet_core::FleetEvent;
    use uuid::Uuid;

    use super::*;
    use crate::memory::MemoryTransport;

    fn settings() -> GatewaySettings {
        GatewaySettings {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(30),
            ..GatewaySettings::default()
        }
    }

    fn recording_bus() -> (EventBus, Arc<Mutex<Vec<FleetEvent>>>) {
        let bus = EventBus::bare();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        })
        .detach();
        (bus, seen)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_construction() {
        let transport = MemoryTransport::new();
        let (bus, _) = recording_bus();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings());
        let id = Uuid::new_v4();

        let waiters: Vec<_> = (0..8).map(|_| manager.of(id)).collect();
        settle().await;
        transport.push_event(id, "start", "{}");

        let clients = futures::future::join_all(waiters).await;
        let first = clients[0].as_ref().unwrap();
        assert!(clients.iter().all(|c| c.as_ref().unwrap().ptr_eq(first)));
        assert_eq!(transport.subscriptions(id), 1);
        assert!(manager.client(id).ptr_eq(first));
    }

    #[tokio::test]
    async fn events_are_republished_and_unknown_kinds_dropped() {
        let transport = MemoryTransport::new();
        let (bus, seen) = recording_bus();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings());
        let id = Uuid::new_v4();

        let connecting = manager.of(id);
        settle().await;
        transport.heartbeat(id);
        transport.push_event(id, "vote_started", "{}");
        transport.push_event(id, "chat", r#"{"player":"Ana","message":"gg"}"#);
        connecting.await.unwrap();
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], FleetEvent::Chat(c) if c.server_id == id && c.message == "gg"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_is_bad_request_and_retried_until_exhausted() {
        let transport = MemoryTransport::new();
        let (bus, seen) = recording_bus();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let log = removed.clone();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings())
            .with_unreachable_handler(move |target: Target| {
                let log = log.clone();
                async move { log.lock().unwrap().push(target.server_id) }
            });
        let id = Uuid::new_v4();

        let err = manager.of(id).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)), "{err:?}");
        assert_eq!(transport.subscriptions(id), 3);

        settle().await;
        assert!(manager.connected().is_empty());
        assert_eq!(*removed.lock().unwrap(), vec![id]);
        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[..], [FleetEvent::Stop(s)] if s.reason == UNREACHABLE_REASON));
    }

    #[tokio::test]
    async fn transient_failure_recovers_without_eviction() {
        let transport = MemoryTransport::new();
        let (bus, _) = recording_bus();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings());
        let id = Uuid::new_v4();

        let connecting = manager.of(id);
        settle().await;
        transport.fail_events(id, GatewayError::Connect("reset".to_string()));

        // Wait for the retry to reopen the stream.
        for _ in 0..100 {
            if transport.open_subscriptions(id) == 1 && transport.subscriptions(id) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.push_event(id, "start", "{}");

        assert!(connecting.await.is_ok());
        assert_eq!(manager.connected(), vec![id]);
    }

    #[tokio::test]
    async fn normal_end_evicts_and_tears_down() {
        let transport = MemoryTransport::new();
        let (bus, seen) = recording_bus();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let log = removed.clone();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings())
            .with_unreachable_handler(move |target: Target| {
                let log = log.clone();
                async move { log.lock().unwrap().push(target.server_id) }
            });
        let id = Uuid::new_v4();

        let connecting = manager.of(id);
        settle().await;
        transport.push_event(id, "start", "{}");
        connecting.await.unwrap();

        transport.close_events(id);
        for _ in 0..100 {
            if !removed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*removed.lock().unwrap(), vec![id]);
        assert!(manager.connected().is_empty());
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, FleetEvent::Stop(s) if s.server_id == id))
        );
    }

    #[tokio::test]
    async fn cancel_evicts_without_teardown_and_allows_recreation() {
        let transport = MemoryTransport::new();
        let (bus, seen) = recording_bus();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let log = removed.clone();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings())
            .with_unreachable_handler(move |target: Target| {
                let log = log.clone();
                async move { log.lock().unwrap().push(target.server_id) }
            });
        let id = Uuid::new_v4();

        let first = manager.client(id);
        let pending = manager.of(id);
        settle().await;
        assert!(manager.cancel(id));
        assert_eq!(pending.await.unwrap_err(), GatewayError::Cancelled);
        settle().await;
        assert_eq!(transport.open_subscriptions(id), 0);
        assert!(removed.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());

        let second = manager.client(id);
        assert!(!first.ptr_eq(&second));
        assert_eq!(transport.subscriptions(id), 1);
        settle().await;
        assert_eq!(transport.subscriptions(id), 2);
    }

    #[tokio::test]
    async fn attach_rebinds_to_a_new_container_without_teardown() {
        let transport = MemoryTransport::new();
        let (bus, seen) = recording_bus();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let log = removed.clone();
        let manager = GatewayManager::new(Arc::new(transport.clone()), bus, settings())
            .with_unreachable_handler(move |target: Target| {
                let log = log.clone();
                async move { log.lock().unwrap().push(target.container) }
            });
        let id = Uuid::new_v4();

        let old = manager.attach(id, "c-old");
        assert!(manager.attach(id, "c-old").ptr_eq(&old));
        assert_eq!(manager.container_of(id).as_deref(), Some("c-old"));
        settle().await;

        let new = manager.attach(id, "c-new");
        assert!(!new.ptr_eq(&old));
        assert_eq!(manager.container_of(id).as_deref(), Some("c-new"));
        settle().await;
        assert_eq!(transport.subscriptions(id), 2);
        assert_eq!(transport.open_subscriptions(id), 1);
        assert!(removed.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());

        transport.close_events(id);
        for _ in 0..100 {
            if !removed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*removed.lock().unwrap(), vec![Some("c-new".to_string())]);
        assert_eq!(manager.container_of(id), None);
    }

    #[tokio::test]
    async fn unbound_client_reports_no_container() {
        let transport = MemoryTransport::new();
        let (bus, _) = recording_bus();
        let manager = GatewayManager::new(Arc::new(transport), bus, settings());
        let id = Uuid::new_v4();

        manager.client(id);
        assert_eq!(manager.connected(), vec![id]);
        assert_eq!(manager.container_of(id), None);
    }
}
