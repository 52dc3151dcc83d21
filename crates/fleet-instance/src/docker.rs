//! Docker implementation of `ContainerEngine`, backed by bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig, PortBinding, RestartPolicyNameEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineEvent, EngineStream, RawStats,
    RestartPolicy,
};
use crate::error::{InstanceError, InstanceResult};

/// Container engine talking to the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the platform defaults (unix socket / named pipe, or
    /// `DOCKER_HOST`).
    pub fn connect() -> InstanceResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| InstanceError::Engine(format!("failed to connect to docker: {e}")))?;
        Ok(Self::new(docker))
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn engine_err(e: DockerError) -> InstanceError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => InstanceError::ContainerNotFound(message),
        other => InstanceError::Engine(other.to_string()),
    }
}

fn is_status(e: &DockerError, code: u16) -> bool {
    matches!(e, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

/// Split `repo[:tag]` so a bare name pulls `latest` instead of every tag.
/// Digest references are passed through untouched.
fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> InstanceResult<()> {
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            if let Err(e) = item {
                // Locally built images have no registry to pull from.
                if self.docker.inspect_image(image).await.is_ok() {
                    warn!(%image, error = %e, "pull failed, using local image");
                    return Ok(());
                }
                return Err(if is_status(&e, 404) {
                    InstanceError::ImageNotFound(image.to_string())
                } else {
                    InstanceError::Engine(e.to_string())
                });
            }
        }

        debug!(%image, "image pulled");
        Ok(())
    }

    async fn image_hash(&self, image: &str) -> InstanceResult<String> {
        let inspect = self.docker.inspect_image(image).await.map_err(|e| {
            if is_status(&e, 404) {
                InstanceError::ImageNotFound(image.to_string())
            } else {
                InstanceError::Engine(e.to_string())
            }
        })?;
        inspect
            .id
            .ok_or_else(|| InstanceError::Engine(format!("image {image} has no id")))
    }

    async fn list_containers(&self, label_filter: &str) -> InstanceResult<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_filter.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(engine_err)?;

        Ok(summaries
            .into_iter()
            .map(|s| ContainerInfo {
                id: s.id.unwrap_or_default(),
                name: s
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: s.labels.unwrap_or_default(),
                running: s.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> InstanceResult<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let restart_policy = bollard::models::RestartPolicy {
            name: Some(match spec.restart {
                RestartPolicy::Never => RestartPolicyNameEnum::NO,
                RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
            }),
            maximum_retry_count: None,
        };

        let log_config = HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(
                [
                    ("max-size".to_string(), spec.log_max_size.clone()),
                    ("max-file".to_string(), spec.log_max_files.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
        };

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(spec.cpu_period),
            memory: Some(spec.memory_bytes),
            restart_policy: Some(restart_policy),
            auto_remove: Some(spec.auto_remove),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            network_mode: spec.network.clone(),
            log_config: Some(log_config),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(engine_err)?;

        for warning in &response.warnings {
            warn!(container = %response.id, %warning, "container created with warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> InstanceResult<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(engine_err)
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> InstanceResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(engine_err(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> InstanceResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_err)
    }

    fn logs(&self, id: &str) -> EngineStream<String> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "0".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|item| item.map(|output| output.to_string()).map_err(engine_err))
            .boxed()
    }

    fn stats(&self, id: &str) -> EngineStream<RawStats> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        self.docker
            .stats(id, Some(options))
            .map(|item| {
                item.map(|s| RawStats {
                    cpu_total: s.cpu_stats.cpu_usage.total_usage,
                    system_cpu: s.cpu_stats.system_cpu_usage,
                    online_cpus: s.cpu_stats.online_cpus,
                    memory_usage: s.memory_stats.usage,
                })
                .map_err(engine_err)
            })
            .boxed()
    }

    fn events(&self) -> EngineStream<EngineEvent> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        self.docker
            .events(Some(options))
            .map(|item| {
                item.map(|message| {
                    let actor = message.actor.unwrap_or_default();
                    EngineEvent {
                        action: message.action.unwrap_or_default(),
                        container_id: actor.id.unwrap_or_default(),
                        labels: actor.attributes.unwrap_or_default(),
                    }
                })
                .map_err(engine_err)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_ref_defaults_to_latest() {
        assert_eq!(
            split_image_ref("game-server"),
            ("game-server".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn split_image_ref_keeps_registry_port() {
        assert_eq!(
            split_image_ref("registry.local:5000/fleet/game-server:v7"),
            (
                "registry.local:5000/fleet/game-server".to_string(),
                "v7".to_string()
            )
        );
        assert_eq!(
            split_image_ref("registry.local:5000/fleet/game-server"),
            (
                "registry.local:5000/fleet/game-server".to_string(),
                "latest".to_string()
            )
        );
    }

    #[test]
    fn split_image_ref_passes_digests_through() {
        let image = "fleet/game-server@sha256:0123";
        assert_eq!(split_image_ref(image), (image.to_string(), String::new()));
    }
}
