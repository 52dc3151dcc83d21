//! fleet-core — shared types for the fleet orchestration crates.
//!
//! Everything the instance manager, gateway and controller exchange lives
//! here: the declared `ServerConfig`, the `ServerMetadata` record that rides
//! on each container as a label, observed `ServerState`, drift entries, the
//! events published on the bus, and the daemon's TOML configuration.
//!
//! # Architecture
//!
//! ```text
//! ServerConfig ──(create)──▶ ServerMetadata ──(label)──▶ container
//!                                                           │
//!                              ServerState ◀──(inspect)─────┘
//! ```
//!
//! `ServerMetadata` is the only persisted record of desired state. It is
//! versioned and decoded leniently so older daemons can read labels written
//! by newer ones.

pub mod config;
pub mod event;
pub mod types;

pub use config::{
    parse_duration, ControllerSettings, FleetConfig, GatewaySettings, InstanceSettings,
};
pub use event::*;
pub use types::*;
