//! In-process container engine.
//!
//! Keeps containers and images in memory and emits the same lifecycle
//! events Docker does ("create", "start", "die", "stop", "destroy").
//! Log, stats and event streams are backed by unbounded channels so tests
//! can push samples and observe when a consumer has closed its stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineEvent, EngineStream, RawStats,
};
use crate::error::{InstanceError, InstanceResult};

struct MemContainer {
    info: ContainerInfo,
    spec: ContainerSpec,
    log_sinks: Vec<UnboundedSender<InstanceResult<String>>>,
    stats_sinks: Vec<UnboundedSender<InstanceResult<RawStats>>>,
}

#[derive(Default)]
struct MemState {
    containers: HashMap<String, MemContainer>,
    images: HashMap<String, String>,
    event_sinks: Vec<UnboundedSender<InstanceResult<EngineEvent>>>,
    calls: Vec<String>,
    next_id: u64,
}

/// Container engine that lives entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make an image available with the given content hash.
    pub fn add_image(&self, image: &str, hash: &str) {
        self.lock()
            .images
            .insert(image.to_string(), hash.to_string());
    }

    /// Engine calls made so far, e.g. `"list fleet.server.id"`, `"stop <id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// The spec a container was created with.
    pub fn spec_of(&self, container_id: &str) -> Option<ContainerSpec> {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    /// Insert a container directly, bypassing create (e.g. with a corrupt label).
    pub fn insert_container(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        running: bool,
    ) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("mem-{:04}", state.next_id);
        let spec = ContainerSpec {
            name: name.to_string(),
            hostname: name.to_string(),
            image: String::new(),
            labels: labels.clone(),
            env: Vec::new(),
            ports: Vec::new(),
            cpu_quota: 0,
            cpu_period: 0,
            memory_bytes: 0,
            restart: crate::engine::RestartPolicy::Never,
            auto_remove: false,
            binds: Vec::new(),
            network: None,
            log_max_size: String::new(),
            log_max_files: 0,
        };
        state.containers.insert(
            id.clone(),
            MemContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: name.to_string(),
                    labels,
                    running,
                },
                spec,
                log_sinks: Vec::new(),
                stats_sinks: Vec::new(),
            },
        );
        id
    }

    /// Mark a container stopped without removing it, as if its process died.
    pub fn kill(&self, container_id: &str) {
        let mut state = self.lock();
        let labels = match state.containers.get_mut(container_id) {
            Some(c) => {
                c.info.running = false;
                c.log_sinks.clear();
                c.stats_sinks.clear();
                c.info.labels.clone()
            }
            None => return,
        };
        emit(&mut state, "die", container_id, labels);
    }

    /// Write a line to every log follower of a container.
    pub fn push_log(&self, container_id: &str, line: &str) {
        let mut state = self.lock();
        if let Some(c) = state.containers.get_mut(container_id) {
            c.log_sinks
                .retain(|tx| tx.unbounded_send(Ok(line.to_string())).is_ok());
        }
    }

    /// Deliver a raw statistics sample to every stats subscriber.
    pub fn push_stats(&self, container_id: &str, sample: RawStats) {
        let mut state = self.lock();
        if let Some(c) = state.containers.get_mut(container_id) {
            c.stats_sinks
                .retain(|tx| tx.unbounded_send(Ok(sample.clone())).is_ok());
        }
    }

    /// End every stats stream of a container.
    pub fn end_stats(&self, container_id: &str) {
        if let Some(c) = self.lock().containers.get_mut(container_id) {
            c.stats_sinks.clear();
        }
    }

    /// Stats subscriptions whose consumer is still alive.
    pub fn open_stats_streams(&self, container_id: &str) -> usize {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.stats_sinks.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Log followers whose consumer is still alive.
    pub fn open_log_streams(&self, container_id: &str) -> usize {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.log_sinks.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Publish an arbitrary engine event.
    pub fn emit_event(&self, event: EngineEvent) {
        self.lock()
            .event_sinks
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// Container IDs currently known, running or not.
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn emit(state: &mut MemState, action: &str, container_id: &str, labels: HashMap<String, String>) {
    let event = EngineEvent {
        action: action.to_string(),
        container_id: container_id.to_string(),
        labels,
    };
    state
        .event_sinks
        .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
}

fn matches_filter(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn pull_image(&self, image: &str) -> InstanceResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("pull {image}"));
        if state.images.contains_key(image) {
            Ok(())
        } else {
            Err(InstanceError::ImageNotFound(image.to_string()))
        }
    }

    async fn image_hash(&self, image: &str) -> InstanceResult<String> {
        let mut state = self.lock();
        state.calls.push(format!("inspect-image {image}"));
        state
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| InstanceError::ImageNotFound(image.to_string()))
    }

    async fn list_containers(&self, label_filter: &str) -> InstanceResult<Vec<ContainerInfo>> {
        let mut state = self.lock();
        state.calls.push(format!("list {label_filter}"));
        let mut found: Vec<ContainerInfo> = state
            .containers
            .values()
            .filter(|c| matches_filter(&c.info.labels, label_filter))
            .map(|c| c.info.clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> InstanceResult<String> {
        let mut state = self.lock();
        state.calls.push(format!("create {}", spec.name));
        if !state.images.contains_key(&spec.image) {
            return Err(InstanceError::ImageNotFound(spec.image.clone()));
        }
        if state.containers.values().any(|c| c.info.name == spec.name) {
            return Err(InstanceError::Engine(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        state.next_id += 1;
        let id = format!("mem-{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            MemContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    labels: spec.labels.clone(),
                    running: false,
                },
                spec: spec.clone(),
                log_sinks: Vec::new(),
                stats_sinks: Vec::new(),
            },
        );
        emit(&mut state, "create", &id, spec.labels.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> InstanceResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("start {id}"));
        let labels = {
            let c = state
                .containers
                .get_mut(id)
                .ok_or_else(|| InstanceError::ContainerNotFound(id.to_string()))?;
            c.info.running = true;
            c.info.labels.clone()
        };
        emit(&mut state, "start", id, labels);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> InstanceResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("stop {id}"));
        let labels = {
            let c = state
                .containers
                .get_mut(id)
                .ok_or_else(|| InstanceError::ContainerNotFound(id.to_string()))?;
            if !c.info.running {
                return Ok(());
            }
            c.info.running = false;
            c.log_sinks.clear();
            c.stats_sinks.clear();
            c.info.labels.clone()
        };
        emit(&mut state, "die", id, labels.clone());
        emit(&mut state, "stop", id, labels);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> InstanceResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("remove {id}"));
        let removed = state
            .containers
            .remove(id)
            .ok_or_else(|| InstanceError::ContainerNotFound(id.to_string()))?;
        emit(&mut state, "destroy", id, removed.info.labels);
        Ok(())
    }

    fn logs(&self, id: &str) -> EngineStream<String> {
        let (tx, rx) = unbounded();
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(c) if c.info.running => c.log_sinks.push(tx),
            Some(_) => {}
            None => {
                let _ = tx.unbounded_send(Err(InstanceError::ContainerNotFound(id.to_string())));
            }
        }
        rx.boxed()
    }

    fn stats(&self, id: &str) -> EngineStream<RawStats> {
        let (tx, rx) = unbounded();
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(c) => c.stats_sinks.push(tx),
            None => {
                let _ = tx.unbounded_send(Err(InstanceError::ContainerNotFound(id.to_string())));
            }
        }
        rx.boxed()
    }

    fn events(&self) -> EngineStream<EngineEvent> {
        let (tx, rx) = unbounded();
        self.lock().event_sinks.push(tx);
        rx.boxed()
    }
}
