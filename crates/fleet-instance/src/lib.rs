//! fleet-instance — container lifecycle for hosted servers.
//!
//! Translates a declared `ServerConfig` into exactly one running container
//! and keeps the container's observable facts available: state, drift
//! against declared config, resource usage, and log output.
//!
//! # Architecture
//!
//! ```text
//! InstanceManager
//!   ├── ContainerEngine (trait)
//!   │   ├── DockerEngine    bollard, production
//!   │   └── MemoryEngine    in-process, tests and dry runs
//!   ├── create()  → stream of LogEvent (pull, dir, port check, recreate, start)
//!   ├── list() / get() / remove()
//!   ├── get_mismatch() → Vec<ServerMisMatch>
//!   ├── usage()   → stream of NodeUsage
//!   └── run()     → log reconciliation + engine event listener
//! ```
//!
//! Containers are self-describing: the `ServerMetadata` label is the only
//! record of desired state. A container whose label is missing or cannot be
//! parsed is removed the moment it is read.

pub mod docker;
pub mod engine;
pub mod error;
mod logs;
pub mod manager;
pub mod memory;
pub mod usage;

pub use docker::DockerEngine;
pub use engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineEvent, EngineStream, PortMapping,
    RawStats, RestartPolicy,
};
pub use error::{InstanceError, InstanceResult};
pub use manager::{InstanceManager, LogStream, UsageStream};
pub use memory::MemoryEngine;
