//! The transport seam between `GatewayClient` and an instance's control
//! endpoint.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use http::Method;

use fleet_core::ServerId;

use crate::error::GatewayResult;
use crate::sse::SseItem;

/// Header carrying the identity the connection belongs to.
pub const SERVER_ID_HEADER: &str = "x-fleet-server-id";

/// Header carrying the connection's creation timestamp (RFC 3339).
pub const CONNECTION_CREATED_HEADER: &str = "x-fleet-connection-created";

/// A stream of inbound events. Dropping it closes the subscription.
pub type EventStream = BoxStream<'static, GatewayResult<SseItem>>;

/// Where a connection points and who it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub server_id: ServerId,
    /// Hostname of the control endpoint; the identity on the fleet network.
    pub host: String,
    pub created_at: DateTime<Utc>,
    /// Container the connection was opened against, when known.
    pub container: Option<String>,
}

impl Target {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            host: server_id.to_string(),
            created_at: Utc::now(),
            container: None,
        }
    }

    pub fn for_container(server_id: ServerId, container: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            ..Self::new(server_id)
        }
    }
}

/// One request/response call.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub body: Bytes,
    pub timeout: Duration,
}

impl GatewayRequest {
    pub fn get(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: Bytes::new(),
            timeout,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: body.into(),
            timeout,
        }
    }
}

#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Perform one call and return the response body.
    ///
    /// Non-2xx responses are `GatewayError::Status`; exceeding
    /// `request.timeout` is `GatewayError::BadRequest`.
    async fn call(&self, target: &Target, request: GatewayRequest) -> GatewayResult<Bytes>;

    /// Open the `/events` subscription. Connection failures surface as the
    /// first stream item.
    fn events(&self, target: &Target) -> EventStream;
}
