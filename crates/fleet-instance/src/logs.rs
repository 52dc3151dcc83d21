//! Log followers and the background loop that keeps them attached.

use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use fleet_core::{LogEvent, ServerId, StartEvent, StopEvent, ID_LABEL};

use crate::engine::{EngineEvent, EngineStream};
use crate::error::InstanceResult;
use crate::manager::InstanceManager;

/// A running log follower. `generation` tells a finished follower apart
/// from one attached after it.
pub(crate) struct Follower {
    generation: u64,
    handle: AbortHandle,
}

const TERMINAL_ACTIONS: [&str; 4] = ["stop", "die", "kill", "destroy"];

impl InstanceManager {
    /// Start republishing a container's output on the bus.
    ///
    /// Returns `false` if a follower is already attached for `id`.
    pub fn attach_logs(&self, id: ServerId, container_id: &str) -> bool {
        match self.followers.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let lines = self.engine.logs(container_id);
                let bus = self.bus.clone();
                let followers = self.followers.clone();
                let container = container_id.to_string();

                let task = tokio::spawn(async move {
                    follow(id, lines, &bus).await;
                    followers.remove_if(&id, |_, f| f.generation == generation);
                    debug!(server_id = %id, %container, "log follower detached");
                });

                slot.insert(Follower {
                    generation,
                    handle: task.abort_handle(),
                });
                debug!(server_id = %id, container = %container_id, "log follower attached");
                true
            }
        }
    }

    /// Stop following a server's output.
    pub fn detach_logs(&self, id: ServerId) {
        if let Some((_, follower)) = self.followers.remove(&id) {
            follower.handle.abort();
        }
    }

    /// Servers with an attached log follower.
    pub fn attached(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.followers.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Attach a follower to every running server that lacks one.
    /// Returns how many were attached.
    pub async fn reconcile_logs(&self) -> InstanceResult<usize> {
        let mut attached = 0;
        for state in self.list().await? {
            if state.running && self.attach_logs(state.id, &state.container_id) {
                attached += 1;
            }
        }
        if attached > 0 {
            info!(count = attached, "reattached log followers");
        }
        Ok(attached)
    }

    /// React to one engine lifecycle event.
    pub fn on_engine_event(&self, event: &EngineEvent) {
        if event.action.starts_with("exec_") {
            return;
        }
        let Some(id) = event.labels.get(ID_LABEL).and_then(|v| v.parse().ok()) else {
            return;
        };

        match event.action.as_str() {
            "start" => {
                self.attach_logs(id, &event.container_id);
                self.bus.publish(StartEvent::new(id));
            }
            action if TERMINAL_ACTIONS.contains(&action) => {
                if action == "destroy" {
                    self.detach_logs(id);
                }
                self.bus.publish(StopEvent::new(id, action));
            }
            _ => {}
        }
    }

    /// Reconcile log followers every `reconcile_interval` and react to engine
    /// events until `shutdown` flips.
    ///
    /// A failed event subscription is reopened on the next reconcile tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.reconcile_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = Some(self.engine.events());

        info!(interval_secs = interval.as_secs(), "instance manager started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_logs().await {
                        warn!(error = %e, "log reconciliation failed");
                    }
                    if events.is_none() {
                        debug!("resubscribing to engine events");
                        events = Some(self.engine.events());
                    }
                }
                item = next_event(&mut events) => match item {
                    Some(Ok(event)) => self.on_engine_event(&event),
                    Some(Err(e)) => {
                        warn!(error = %e, "engine event stream failed");
                        events = None;
                    }
                    None => {
                        warn!("engine event stream ended");
                        events = None;
                    }
                },
                _ = shutdown.changed() => {
                    info!("instance manager shutting down");
                    break;
                }
            }
        }

        for id in self.attached() {
            self.detach_logs(id);
        }
    }
}

async fn next_event(
    events: &mut Option<EngineStream<EngineEvent>>,
) -> Option<InstanceResult<EngineEvent>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn follow(id: ServerId, mut lines: EngineStream<String>, bus: &fleet_events::EventBus) {
    while let Some(item) = lines.next().await {
        match item {
            Ok(chunk) => {
                for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
                    bus.publish(LogEvent::info(id, line));
                }
            }
            Err(e) => {
                debug!(server_id = %id, error = %e, "log stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use fleet_core::{FleetEvent, InstanceSettings, ResourcePlan, ServerConfig, METADATA_LABEL};
    use fleet_events::EventBus;
    use uuid::Uuid;

    use super::*;
    use crate::memory::MemoryEngine;
    use crate::engine::ContainerEngine;

    const IMAGE: &str = "fleet/game-server:v7";

    struct Harness {
        engine: MemoryEngine,
        manager: InstanceManager,
        seen: Arc<Mutex<Vec<FleetEvent>>>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        engine.add_image(IMAGE, "sha256:one");
        let bus = EventBus::bare();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        })
        .detach();

        let settings = InstanceSettings {
            data_dir: dir.path().to_path_buf(),
            default_image: IMAGE.to_string(),
            reconcile_interval: Duration::from_millis(50),
            ..InstanceSettings::default()
        };
        Harness {
            manager: InstanceManager::new(Arc::new(engine.clone()), bus, settings),
            engine,
            seen,
            _dir: dir,
        }
    }

    async fn provision(h: &Harness, port: u16) -> (ServerId, String) {
        let config = ServerConfig {
            id: Uuid::new_v4(),
            name: "lobby".to_string(),
            description: String::new(),
            mode: "survival".to_string(),
            image: None,
            port,
            plan: ResourcePlan { cpu: 1.0, ram_mb: 256 },
            env: BTreeMap::new(),
            auto_turn_off: false,
            is_hub: true,
            host_command: None,
            mods: Vec::new(),
        };
        let events: Vec<LogEvent> = h.manager.create(config.clone()).collect().await;
        assert!(!events.iter().any(LogEvent::is_error), "{events:?}");
        let state = h.manager.get(config.id).await.unwrap();
        (config.id, state.container_id)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn logs_of(seen: &Mutex<Vec<FleetEvent>>) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.as_log().map(|l| l.message.clone()))
            .collect()
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let h = harness();
        let (id, cid) = provision(&h, 7000).await;

        assert!(h.manager.attach_logs(id, &cid));
        assert!(!h.manager.attach_logs(id, &cid));
        assert_eq!(h.engine.open_log_streams(&cid), 1);
        assert_eq!(h.manager.attached(), vec![id]);
    }

    #[tokio::test]
    async fn follower_republishes_non_blank_lines() {
        let h = harness();
        let (id, cid) = provision(&h, 7000).await;
        h.manager.attach_logs(id, &cid);

        h.engine.push_log(&cid, "Server loaded\n\n   \nMap: Ancient Caldera\n");
        eventually(|| logs_of(&h.seen).len() == 2).await;
        assert_eq!(logs_of(&h.seen), vec!["Server loaded", "Map: Ancient Caldera"]);
        assert!(h
            .seen
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.server_id() == id));
    }

    #[tokio::test]
    async fn follower_removes_itself_when_stream_ends() {
        let h = harness();
        let (id, cid) = provision(&h, 7000).await;
        h.manager.attach_logs(id, &cid);

        h.engine.kill(&cid);
        eventually(|| h.manager.attached().is_empty()).await;
    }

    #[tokio::test]
    async fn reconcile_attaches_only_missing_running_servers() {
        let h = harness();
        let (a, a_cid) = provision(&h, 7000).await;
        let (b, b_cid) = provision(&h, 7001).await;
        h.manager.attach_logs(a, &a_cid);

        assert_eq!(h.manager.reconcile_logs().await.unwrap(), 1);
        assert_eq!(h.engine.open_log_streams(&a_cid), 1);
        assert_eq!(h.engine.open_log_streams(&b_cid), 1);

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(h.manager.attached(), expected);
        assert_eq!(h.manager.reconcile_logs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_event_attaches_and_publishes_start() {
        let h = harness();
        let (id, cid) = provision(&h, 7000).await;
        let labels = HashMap::from([(ID_LABEL.to_string(), id.to_string())]);

        h.manager.on_engine_event(&EngineEvent {
            action: "start".to_string(),
            container_id: cid.clone(),
            labels,
        });

        assert_eq!(h.manager.attached(), vec![id]);
        let seen = h.seen.lock().unwrap();
        assert!(matches!(seen.last(), Some(FleetEvent::Start(e)) if e.server_id == id));
    }

    #[tokio::test]
    async fn terminal_events_publish_stop_and_exec_is_ignored() {
        let h = harness();
        let id = Uuid::new_v4();
        let labels = HashMap::from([(ID_LABEL.to_string(), id.to_string())]);
        let event = |action: &str| EngineEvent {
            action: action.to_string(),
            container_id: "mem-0042".to_string(),
            labels: labels.clone(),
        };

        h.manager.on_engine_event(&event("exec_start: sh -c status"));
        h.manager.on_engine_event(&event("die"));
        h.manager.on_engine_event(&event("destroy"));
        h.manager.on_engine_event(&EngineEvent {
            action: "die".to_string(),
            container_id: "unmanaged".to_string(),
            labels: HashMap::from([(METADATA_LABEL.to_string(), "x".to_string())]),
        });

        let seen = h.seen.lock().unwrap();
        let reasons: Vec<&str> = seen
            .iter()
            .filter_map(|e| match e {
                FleetEvent::Stop(s) if s.server_id == id => Some(s.reason.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["die", "destroy"]);
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn run_follows_lifecycle_and_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let manager = h.manager.clone();
        let task = tokio::spawn(async move { manager.run(rx).await });

        let (id, cid) = provision(&h, 7000).await;
        eventually(|| h.manager.attached() == vec![id]).await;

        h.engine.stop_container(&cid, 1).await.unwrap();
        eventually(|| {
            h.seen
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, FleetEvent::Stop(s) if s.server_id == id))
        })
        .await;
        eventually(|| h.manager.attached().is_empty()).await;

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
