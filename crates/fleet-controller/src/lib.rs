//! fleet-controller — orchestration on top of the instance manager and the
//! gateway.
//!
//! # Architecture
//!
//! ```text
//! FleetController
//!   ├── host()          Create → AwaitHealthy → Host, as a LogEvent stream
//!   ├── reap_idle()     KillFlag hysteresis over auto-turn-off servers
//!   ├── attach_all()    one gateway connection per running server
//!   ├── get_mismatch() / usage() / admin operations
//!   └── run()           attach loop + reaper loop until shutdown
//! ```

pub mod controller;
pub mod error;
pub mod host;
pub mod reaper;

pub use controller::FleetController;
pub use error::{FleetError, FleetResult};
pub use host::{Stage, HOSTING_MESSAGE};
pub use reaper::{KillFlag, Verdict};
