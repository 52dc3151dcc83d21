//! fleet-gateway — live control connections to hosted servers.
//!
//! Each hosted server runs a small control endpoint. The gateway keeps one
//! long-lived server-sent-events subscription per server, republishes what
//! arrives on the event bus, and exposes the endpoint's request/response
//! operations through `GatewayClient`.
//!
//! # Architecture
//!
//! ```text
//! GatewayManager
//!   ├── DashMap<ServerId, Slot>    one shared construction per identity
//!   ├── GatewayClient              typed calls: /ok, /state, /host, ...
//!   └── GatewayTransport (trait)
//!       ├── HttpTransport          hyper, http://{id}:{control_port}
//!       └── MemoryTransport        in-process fakes for tests
//! ```

pub mod client;
pub mod error;
pub mod http_transport;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod sse;
pub mod transport;

pub use client::{GatewayClient, HostRequest};
pub use error::{GatewayError, GatewayResult};
pub use http_transport::HttpTransport;
pub use manager::{Connecting, GatewayManager, UnreachableHandler, UNREACHABLE_REASON};
pub use memory::MemoryTransport;
pub use sse::{SseDecoder, SseItem, SseMessage};
pub use transport::{GatewayRequest, GatewayTransport, Target};
