//! Instance manager: one container per declared server.
//!
//! `create()` runs the provisioning steps in order and reports each as a
//! `LogEvent`. Failures never escape the stream: they become a final error
//! event, so callers always learn which step failed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use fleet_core::{
    InstanceSettings, InstanceStatus, LogEvent, NodeUsage, ServerConfig, ServerId,
    ServerMetadata, ServerMisMatch, ServerState, ID_LABEL, METADATA_LABEL,
};
use fleet_events::EventBus;

use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, PortMapping, RestartPolicy};
use crate::error::{InstanceError, InstanceResult};
use crate::logs::Follower;
use crate::usage::node_usage;

/// Progress of a provisioning or host sequence.
pub type LogStream = BoxStream<'static, LogEvent>;

/// Continuous resource usage of one server.
pub type UsageStream = BoxStream<'static, NodeUsage>;

/// Manages server containers through a `ContainerEngine`.
///
/// Cheap to clone; clones share the engine, bus and log-follower registry.
#[derive(Clone)]
pub struct InstanceManager {
    pub(crate) engine: Arc<dyn ContainerEngine>,
    pub(crate) bus: EventBus,
    pub(crate) settings: Arc<InstanceSettings>,
    /// Attached log followers: server id → follower.
    pub(crate) followers: Arc<DashMap<ServerId, Follower>>,
    pub(crate) generation: Arc<AtomicU64>,
}

impl InstanceManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: EventBus,
        settings: InstanceSettings,
    ) -> Self {
        Self {
            engine,
            bus,
            settings: Arc::new(settings),
            followers: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Provision a container for `config`, replacing any previous container
    /// with the same identity.
    ///
    /// The stream ends after a final "started" event, or after a single
    /// error event if any step fails.
    ///
    /// Provisioning starts immediately, not on first poll, and runs to
    /// completion even if the stream is dropped; a half-created container
    /// would otherwise be left behind.
    pub fn create(&self, config: ServerConfig) -> LogStream {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();

        tokio::spawn(async move {
            let id = config.id;
            if let Err(e) = this.provision(config, &tx).await {
                warn!(server_id = %id, error = %e, "provisioning failed");
                let _ = tx.send(LogEvent::error(id, e.to_string())).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn provision(
        &self,
        config: ServerConfig,
        tx: &mpsc::Sender<LogEvent>,
    ) -> InstanceResult<()> {
        let id = config.id;
        // A dropped receiver must not abort provisioning halfway.
        let progress = |message: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(LogEvent::info(id, message)).await;
            }
        };

        let image = config.image_or(&self.settings.default_image).to_string();
        progress(format!("Pulling image {image}")).await;
        self.engine.pull_image(&image).await?;

        let host_dir = self.host_dir(id);
        progress(format!("Preparing host directory {}", host_dir.display())).await;
        tokio::fs::create_dir_all(&host_dir).await?;

        progress(format!("Checking port {}", config.port)).await;
        let containers = self.engine.list_containers(ID_LABEL).await?;
        for container in &containers {
            if let Some(meta) = decode_metadata(container)
                && meta.config.id != id
                && meta.config.port == config.port
            {
                return Err(InstanceError::PortConflict {
                    port: config.port,
                    owner: meta.config.id,
                });
            }
        }

        for stale in containers.iter().filter(|c| label_id(c) == Some(id)) {
            progress(format!("Removing previous container {}", stale.name)).await;
            self.stop_and_remove(stale).await?;
        }

        let image_hash = self.engine.image_hash(&image).await?;
        let meta = ServerMetadata::new(config.clone(), image_hash);
        let spec = self.container_spec(&config, &image, &meta)?;

        progress(format!("Creating container {}", spec.name)).await;
        let container_id = self.engine.create_container(&spec).await?;
        self.engine.start_container(&container_id).await?;

        info!(server_id = %id, container = %container_id, %image, "server container started");
        progress("Server container started".to_string()).await;
        Ok(())
    }

    /// Build the engine spec for a server.
    pub fn container_spec(
        &self,
        config: &ServerConfig,
        image: &str,
        meta: &ServerMetadata,
    ) -> InstanceResult<ContainerSpec> {
        let id = config.id;
        let settings = &self.settings;

        let labels = HashMap::from([
            (ID_LABEL.to_string(), id.to_string()),
            (METADATA_LABEL.to_string(), meta.to_label()?),
        ]);

        let mut env: Vec<String> =
            config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push(format!("SERVER_ID={id}"));
        env.push(format!("IS_HUB={}", config.is_hub));

        let ports = ["tcp", "udp"]
            .into_iter()
            .map(|protocol| PortMapping {
                container_port: settings.game_port,
                host_port: config.port,
                protocol,
            })
            .collect();

        let (restart, auto_remove) = if config.auto_turn_off {
            (RestartPolicy::Never, true)
        } else {
            (RestartPolicy::UnlessStopped, false)
        };

        Ok(ContainerSpec {
            name: id.to_string(),
            hostname: id.to_string(),
            image: image.to_string(),
            labels,
            env,
            ports,
            cpu_quota: (config.plan.cpu * settings.cpu_period as f64).round() as i64,
            cpu_period: settings.cpu_period,
            memory_bytes: (config.plan.ram_mb * 1024 * 1024) as i64,
            restart,
            auto_remove,
            binds: vec![format!("{}:/config", self.host_dir(id).display())],
            network: settings.network.clone(),
            log_max_size: settings.log_max_size.clone(),
            log_max_files: settings.log_max_files,
        })
    }

    /// Host directory bind-mounted into a server's container.
    pub fn host_dir(&self, id: ServerId) -> PathBuf {
        self.settings.data_dir.join("servers").join(id.to_string())
    }

    /// Every managed server with readable metadata.
    ///
    /// Containers with a missing or corrupt metadata label are removed.
    pub async fn list(&self) -> InstanceResult<Vec<ServerState>> {
        let containers = self.engine.list_containers(ID_LABEL).await?;
        let mut states = Vec::with_capacity(containers.len());

        for container in containers {
            match read_state(&container) {
                Ok(state) => states.push(state),
                Err(e) => {
                    warn!(
                        container = %container.id,
                        error = %e,
                        "removing container with unreadable metadata"
                    );
                    if let Err(e) = self.engine.remove_container(&container.id).await {
                        warn!(
                            container = %container.id,
                            error = %e,
                            "failed to remove orphaned container"
                        );
                    }
                }
            }
        }

        Ok(states)
    }

    /// The state of one server.
    pub async fn get(&self, id: ServerId) -> InstanceResult<ServerState> {
        self.list()
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(InstanceError::NotFound(id))
    }

    /// Stop (if needed) and remove the container of `id`.
    pub async fn remove(&self, id: ServerId) -> InstanceResult<()> {
        let containers = self
            .engine
            .list_containers(&format!("{ID_LABEL}={id}"))
            .await?;
        if containers.is_empty() {
            return Err(InstanceError::NotFound(id));
        }

        for container in &containers {
            self.stop_and_remove(container).await?;
        }
        info!(server_id = %id, "server removed");
        Ok(())
    }

    /// Stop and remove one specific container of `id`.
    ///
    /// Returns `false` if that container no longer exists; other containers
    /// of the same identity are left alone.
    pub async fn remove_container(&self, id: ServerId, container_id: &str) -> InstanceResult<bool> {
        let containers = self
            .engine
            .list_containers(&format!("{ID_LABEL}={id}"))
            .await?;
        let Some(container) = containers.iter().find(|c| c.id == container_id) else {
            debug!(server_id = %id, container = %container_id, "container already gone");
            return Ok(false);
        };

        self.stop_and_remove(container).await?;
        info!(server_id = %id, container = %container_id, "server container removed");
        Ok(true)
    }

    async fn stop_and_remove(&self, container: &ContainerInfo) -> InstanceResult<()> {
        if container.running {
            self.engine
                .stop_container(&container.id, self.settings.stop_timeout_secs)
                .await?;
        }
        match self.engine.remove_container(&container.id).await {
            // Auto-remove containers may already be gone once stopped.
            Ok(()) | Err(InstanceError::ContainerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Compare a server against its authoritative config and observed runtime.
    ///
    /// `observed` is the instance's own report, when reachable. Returns an
    /// empty list when everything matches.
    pub async fn get_mismatch(
        &self,
        id: ServerId,
        config: &ServerConfig,
        observed: Option<&InstanceStatus>,
    ) -> InstanceResult<Vec<ServerMisMatch>> {
        let state = self.get(id).await?;
        let default_image = &self.settings.default_image;
        let mut mismatches = compare_config(&state.meta.config, config, default_image);

        let image = state.meta.config.image_or(default_image);
        let current_hash = self.engine.image_hash(image).await?;
        if current_hash != state.meta.image_hash {
            mismatches.push(ServerMisMatch::new(
                "image_hash",
                &state.meta.image_hash,
                current_hash,
            ));
        }

        if let Some(status) = observed {
            if state.running != status.hosting {
                mismatches.push(ServerMisMatch::new("running", status.hosting, state.running));
            }

            let mut expected: Vec<&str> = config.mods.iter().map(String::as_str).collect();
            let mut actual: Vec<&str> = status.mods.iter().map(|m| m.id.as_str()).collect();
            expected.sort_unstable();
            actual.sort_unstable();
            if expected != actual {
                mismatches.push(ServerMisMatch::new(
                    "mods",
                    actual.join(","),
                    expected.join(","),
                ));
            }
        }

        debug!(server_id = %id, count = mismatches.len(), "mismatch check complete");
        Ok(mismatches)
    }

    /// Follow a server's CPU and RAM usage until the stream is dropped or
    /// the container's statistics stream ends.
    pub async fn usage(&self, id: ServerId) -> InstanceResult<UsageStream> {
        let state = self.get(id).await?;
        Ok(node_usage(id, self.engine.stats(&state.container_id)))
    }
}

/// Identity from the plain id label.
pub(crate) fn label_id(container: &ContainerInfo) -> Option<ServerId> {
    container.labels.get(ID_LABEL)?.parse().ok()
}

fn decode_metadata(container: &ContainerInfo) -> Option<ServerMetadata> {
    let raw = container.labels.get(METADATA_LABEL)?;
    ServerMetadata::from_label(raw).ok()
}

pub(crate) fn read_state(container: &ContainerInfo) -> InstanceResult<ServerState> {
    let raw = container
        .labels
        .get(METADATA_LABEL)
        .ok_or_else(|| InstanceError::MissingMetadata(container.id.clone()))?;
    let meta = ServerMetadata::from_label(raw)?;
    Ok(ServerState {
        id: meta.config.id,
        container_id: container.id.clone(),
        running: container.running,
        meta,
    })
}

/// Field-by-field comparison of provisioned vs declared config.
///
/// Mods are compared against what the instance reports, not here.
fn compare_config(
    actual: &ServerConfig,
    expected: &ServerConfig,
    default_image: &str,
) -> Vec<ServerMisMatch> {
    let mut out = Vec::new();
    let mut check = |field: &str, a: String, e: String| {
        if a != e {
            out.push(ServerMisMatch::new(field, a, e));
        }
    };

    check("name", actual.name.clone(), expected.name.clone());
    check("description", actual.description.clone(), expected.description.clone());
    check("mode", actual.mode.clone(), expected.mode.clone());
    check(
        "image",
        actual.image_or(default_image).to_string(),
        expected.image_or(default_image).to_string(),
    );
    check("port", actual.port.to_string(), expected.port.to_string());
    check("plan.cpu", actual.plan.cpu.to_string(), expected.plan.cpu.to_string());
    check("plan.ram_mb", actual.plan.ram_mb.to_string(), expected.plan.ram_mb.to_string());
    check("env", format!("{:?}", actual.env), format!("{:?}", expected.env));
    check(
        "auto_turn_off",
        actual.auto_turn_off.to_string(),
        expected.auto_turn_off.to_string(),
    );
    check("is_hub", actual.is_hub.to_string(), expected.is_hub.to_string());
    check(
        "host_command",
        actual.host_command.clone().unwrap_or_default(),
        expected.host_command.clone().unwrap_or_default(),
    );

    out
}
