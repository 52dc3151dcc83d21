//! The container engine seam.
//!
//! `InstanceManager` talks to the engine only through `ContainerEngine`,
//! using the engine-neutral types below. Long-lived streams (logs, stats,
//! events) are closed by dropping them.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::InstanceResult;

/// A stream produced by the engine. Dropping it closes the subscription.
pub type EngineStream<T> = BoxStream<'static, InstanceResult<T>>;

/// One container as seen by a list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Restart behaviour of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    UnlessStopped,
}

/// A published container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    /// "tcp" or "udp".
    pub protocol: &'static str,
}

/// Everything needed to create one server container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub memory_bytes: i64,
    pub restart: RestartPolicy,
    pub auto_remove: bool,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub network: Option<String>,
    pub log_max_size: String,
    pub log_max_files: u32,
}

/// One raw statistics sample, before delta computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStats {
    /// Cumulative container CPU time (ns).
    pub cpu_total: u64,
    /// Cumulative host CPU time (ns), if reported.
    pub system_cpu: Option<u64>,
    pub online_cpus: Option<u64>,
    /// Current memory usage (bytes), if reported.
    pub memory_usage: Option<u64>,
}

/// A container lifecycle event from the engine-wide event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// Engine action name: "start", "die", "exec_create: ...", etc.
    pub action: String,
    pub container_id: String,
    /// Container labels (and other actor attributes).
    pub labels: HashMap<String, String>,
}

/// Operations the instance manager needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull an image. Fails with `ImageNotFound` if it cannot be obtained.
    async fn pull_image(&self, image: &str) -> InstanceResult<()>;

    /// Resolve an image's content hash.
    async fn image_hash(&self, image: &str) -> InstanceResult<String>;

    /// List containers (running or not) matching a label filter
    /// (`key` or `key=value`).
    async fn list_containers(&self, label_filter: &str) -> InstanceResult<Vec<ContainerInfo>>;

    /// Create a container and return its engine ID.
    async fn create_container(&self, spec: &ContainerSpec) -> InstanceResult<String>;

    async fn start_container(&self, id: &str) -> InstanceResult<()>;

    /// Stop a container; stopping an already stopped container succeeds.
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> InstanceResult<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> InstanceResult<()>;

    /// Follow stdout/stderr from now on. Each item may hold several lines.
    fn logs(&self, id: &str) -> EngineStream<String>;

    /// Follow raw resource statistics.
    fn stats(&self, id: &str) -> EngineStream<RawStats>;

    /// Follow the engine-wide container event stream.
    fn events(&self) -> EngineStream<EngineEvent>;
}
