//! In-process transport: fake control endpoints for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use fleet_core::ServerId;

use crate::error::{GatewayError, GatewayResult};
use crate::sse::{SseItem, SseMessage};
use crate::transport::{EventStream, GatewayRequest, GatewayTransport, Target};

/// Request handler of a fake instance.
pub type Handler = Arc<dyn Fn(&GatewayRequest) -> GatewayResult<Bytes> + Send + Sync>;

#[derive(Default)]
struct FakeInstance {
    handler: Option<Handler>,
    sinks: Vec<UnboundedSender<GatewayResult<SseItem>>>,
    unreachable: bool,
    subscriptions: usize,
    calls: Vec<(String, String)>,
}

/// Transport whose instances are closures and channels.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    instances: Arc<Mutex<HashMap<ServerId, FakeInstance>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServerId, FakeInstance>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer calls to `id` with `handler`.
    pub fn route<F>(&self, id: ServerId, handler: F)
    where
        F: Fn(&GatewayRequest) -> GatewayResult<Bytes> + Send + Sync + 'static,
    {
        self.lock().entry(id).or_default().handler = Some(Arc::new(handler));
    }

    /// Refuse connections to `id` (calls and subscriptions).
    pub fn set_unreachable(&self, id: ServerId, unreachable: bool) {
        self.lock().entry(id).or_default().unreachable = unreachable;
    }

    /// Send an event to every open subscription of `id`.
    pub fn push_event(&self, id: ServerId, kind: &str, data: &str) {
        self.push(
            id,
            Ok(SseItem::Message(SseMessage {
                event: kind.to_string(),
                data: data.to_string(),
                id: None,
            })),
        );
    }

    pub fn heartbeat(&self, id: ServerId) {
        self.push(id, Ok(SseItem::Comment("ping".to_string())));
    }

    /// Fail every open subscription of `id` with `error`.
    pub fn fail_events(&self, id: ServerId, error: GatewayError) {
        self.push(id, Err(error));
        self.close_events(id);
    }

    /// End every open subscription of `id` normally.
    pub fn close_events(&self, id: ServerId) {
        if let Some(instance) = self.lock().get_mut(&id) {
            instance.sinks.clear();
        }
    }

    fn push(&self, id: ServerId, item: GatewayResult<SseItem>) {
        if let Some(instance) = self.lock().get_mut(&id) {
            instance
                .sinks
                .retain(|tx| tx.unbounded_send(item.clone()).is_ok());
        }
    }

    /// Subscriptions ever opened to `id`.
    pub fn subscriptions(&self, id: ServerId) -> usize {
        self.lock().get(&id).map(|i| i.subscriptions).unwrap_or(0)
    }

    /// Subscriptions to `id` whose consumer is still alive.
    pub fn open_subscriptions(&self, id: ServerId) -> usize {
        self.lock()
            .get(&id)
            .map(|i| i.sinks.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Calls made to `id`, e.g. `"GET /ok"`.
    pub fn calls(&self, id: ServerId) -> Vec<String> {
        self.lock()
            .get(&id)
            .map(|i| i.calls.iter().map(|(call, _)| call.clone()).collect())
            .unwrap_or_default()
    }

    /// Request bodies sent to `id`, in call order.
    pub fn bodies(&self, id: ServerId) -> Vec<String> {
        self.lock()
            .get(&id)
            .map(|i| i.calls.iter().map(|(_, body)| body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GatewayTransport for MemoryTransport {
    async fn call(&self, target: &Target, request: GatewayRequest) -> GatewayResult<Bytes> {
        let handler = {
            let mut instances = self.lock();
            let instance = instances.entry(target.server_id).or_default();
            instance.calls.push((
                format!("{} {}", request.method, request.path),
                String::from_utf8_lossy(&request.body).to_string(),
            ));
            if instance.unreachable {
                return Err(GatewayError::Connect(format!("{} unreachable", target.host)));
            }
            instance.handler.clone()
        };

        match handler {
            Some(handler) => handler(&request),
            None => Err(GatewayError::Status {
                status: 404,
                path: request.path,
            }),
        }
    }

    fn events(&self, target: &Target) -> EventStream {
        let (tx, rx) = unbounded();
        let mut instances = self.lock();
        let instance = instances.entry(target.server_id).or_default();
        instance.subscriptions += 1;
        if instance.unreachable {
            let _ = tx.unbounded_send(Err(GatewayError::Connect(format!(
                "{} unreachable",
                target.host
            ))));
        } else {
            instance.sinks.push(tx);
        }
        rx.boxed()
    }
}
