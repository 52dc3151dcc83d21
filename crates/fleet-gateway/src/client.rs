//! Typed operations against one instance's control endpoint.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use fleet_core::{GatewaySettings, InstanceStatus, Player, PlayerUpdate, ServerConfig, ServerId};

use crate::error::GatewayResult;
use crate::transport::{GatewayRequest, GatewayTransport, Target};

/// Body of `POST /host`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl From<&ServerConfig> for HostRequest {
    fn from(config: &ServerConfig) -> Self {
        Self {
            mode: config.mode.clone(),
            command: config.host_command.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    probe: Duration,
    request: Duration,
    host: Duration,
}

struct ClientInner {
    target: Target,
    transport: Arc<dyn GatewayTransport>,
    timeouts: Timeouts,
}

/// Handle to one instance's control endpoint.
///
/// Clones share the connection identity; `ptr_eq` tells whether two
/// handles came from the same construction.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("server_id", &self.inner.target.server_id)
            .field("created_at", &self.inner.target.created_at)
            .finish()
    }
}

impl GatewayClient {
    pub fn new(
        target: Target,
        transport: Arc<dyn GatewayTransport>,
        settings: &GatewaySettings,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                target,
                transport,
                timeouts: Timeouts {
                    probe: settings.probe_timeout,
                    request: settings.request_timeout,
                    host: settings.host_timeout,
                },
            }),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.target.server_id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn call(&self, request: GatewayRequest) -> GatewayResult<Bytes> {
        debug!(
            server_id = %self.server_id(),
            method = %request.method,
            path = %request.path,
            "gateway call"
        );
        self.inner.transport.call(&self.inner.target, request).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> GatewayResult<T> {
        let body = self.call(GatewayRequest::get(path, timeout)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &impl Serialize,
        timeout: Duration,
    ) -> GatewayResult<Bytes> {
        let body = serde_json::to_vec(body)?;
        self.call(GatewayRequest::post(path, body, timeout)).await
    }

    /// Health probe.
    pub async fn ok(&self) -> GatewayResult<()> {
        self.call(GatewayRequest::get("/ok", self.inner.timeouts.probe))
            .await
            .map(drop)
    }

    /// Raw state snapshot as the instance reports it.
    pub async fn raw_state(&self) -> GatewayResult<Value> {
        self.get_json("/state", self.inner.timeouts.request).await
    }

    pub async fn state(&self) -> GatewayResult<InstanceStatus> {
        self.get_json("/state", self.inner.timeouts.request).await
    }

    pub async fn players(&self) -> GatewayResult<Vec<Player>> {
        self.get_json("/players", self.inner.timeouts.request).await
    }

    pub async fn send_commands(&self, commands: &[String]) -> GatewayResult<()> {
        self.post_json("/commands", &commands, self.inner.timeouts.request)
            .await
            .map(drop)
    }

    /// Broadcast a chat message to every player.
    pub async fn say(&self, message: &str) -> GatewayResult<()> {
        self.post_json("/say", &json!({ "message": message }), self.inner.timeouts.request)
            .await
            .map(drop)
    }

    pub async fn host(&self, request: &HostRequest) -> GatewayResult<()> {
        self.post_json("/host", request, self.inner.timeouts.host)
            .await
            .map(drop)
    }

    pub async fn is_hosting(&self) -> GatewayResult<bool> {
        self.get_json("/hosting", self.inner.timeouts.probe).await
    }

    pub async fn pause(&self) -> GatewayResult<()> {
        self.call(GatewayRequest::post("/pause", Bytes::new(), self.inner.timeouts.request))
            .await
            .map(drop)
    }

    /// Preview image of the current map (PNG bytes).
    pub async fn image(&self) -> GatewayResult<Bytes> {
        self.call(GatewayRequest::get("/image", self.inner.timeouts.host))
            .await
    }

    pub async fn workflows(&self) -> GatewayResult<Value> {
        self.get_json("/workflow", self.inner.timeouts.request).await
    }

    pub async fn set_workflows(&self, workflows: &Value) -> GatewayResult<()> {
        self.post_json("/workflow", workflows, self.inner.timeouts.request)
            .await
            .map(drop)
    }

    pub async fn update_player(&self, update: &PlayerUpdate) -> GatewayResult<()> {
        self.post_json("/players/update", update, self.inner.timeouts.request)
            .await
            .map(drop)
    }
}
