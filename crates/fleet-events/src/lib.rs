//! fleet-events — process-wide fan-out of fleet events.
//!
//! Producers (instance manager, gateway connections) publish
//! `FleetEvent`s; any number of observers subscribe with a plain closure.
//! Dispatch is synchronous and in subscription order per publish. There is
//! no persistence and no replay for late subscribers.
//!
//! A failing handler (returned error or panic) is logged and stays
//! registered; it never affects the publisher or other handlers.

pub mod bus;

pub use bus::{EventBus, EventHandler, Subscription};
