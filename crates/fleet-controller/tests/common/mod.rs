//! Shared fixtures: an in-memory fleet and a cooperative fake instance.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use uuid::Uuid;

use fleet_controller::FleetController;
use fleet_core::{FleetConfig, FleetEvent, LogEvent, ResourcePlan, ServerConfig, ServerId};
use fleet_events::EventBus;
use fleet_gateway::{GatewayError, MemoryTransport};
use fleet_instance::MemoryEngine;

pub const IMAGE: &str = "fleet/game-server:v7";

pub struct Fleet {
    pub engine: MemoryEngine,
    pub transport: MemoryTransport,
    pub bus: EventBus,
    pub controller: FleetController,
    pub seen: Arc<Mutex<Vec<FleetEvent>>>,
    _dir: tempfile::TempDir,
}

pub fn config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.instance.default_image = IMAGE.to_string();
    config.gateway.idle_timeout = Duration::from_secs(3600);
    config.gateway.retry_attempts = 2;
    config.gateway.retry_delay = Duration::from_millis(10);
    config.controller.health_attempts = 20;
    config.controller.health_delay = Duration::from_millis(5);
    config.controller.host_poll_attempts = 20;
    config.controller.host_poll_delay = Duration::from_millis(5);
    config.controller.reap_query_delay = Duration::from_millis(5);
    config
}

pub fn fleet() -> Fleet {
    fleet_with(config())
}

pub fn fleet_with(mut config: FleetConfig) -> Fleet {
    let dir = tempfile::tempdir().unwrap();
    config.instance.data_dir = dir.path().to_path_buf();

    let engine = MemoryEngine::new();
    engine.add_image(IMAGE, "sha256:one");
    let transport = MemoryTransport::new();
    let bus = EventBus::bare();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(move |e| {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    })
    .detach();

    let controller = FleetController::assemble(
        Arc::new(engine.clone()),
        Arc::new(transport.clone()),
        bus.clone(),
        &config,
    );

    Fleet {
        engine,
        transport,
        bus,
        controller,
        seen,
        _dir: dir,
    }
}

pub fn server(port: u16, auto_turn_off: bool) -> ServerConfig {
    ServerConfig {
        id: Uuid::new_v4(),
        name: "Caldera".to_string(),
        description: "friday night pvp".to_string(),
        mode: "pvp".to_string(),
        image: None,
        port,
        plan: ResourcePlan {
            cpu: 1.0,
            ram_mb: 512,
        },
        env: BTreeMap::new(),
        auto_turn_off,
        is_hub: false,
        host_command: None,
        mods: Vec::new(),
    }
}

/// Create the container directly, without hosting.
pub async fn provision(fleet: &Fleet, config: &ServerConfig) {
    let events: Vec<LogEvent> = fleet
        .controller
        .instances()
        .create(config.clone())
        .collect()
        .await;
    assert!(!events.iter().any(LogEvent::is_error), "{events:?}");
}

/// A control endpoint that boots after a few probes and starts hosting
/// when asked.
#[derive(Clone, Default)]
pub struct FakeInstance {
    pub probes: Arc<AtomicUsize>,
    pub hosting: Arc<AtomicBool>,
    pub players: Arc<AtomicU32>,
    /// Ignore host requests.
    pub stuck: Arc<AtomicBool>,
    /// Fail every state query.
    pub broken_state: Arc<AtomicBool>,
}

impl FakeInstance {
    pub fn install(fleet: &Fleet, id: ServerId, healthy_after: usize) -> Self {
        let fake = Self::default();
        let state = fake.clone();
        let bus = fleet.bus.clone();

        fleet.transport.route(id, move |req| match req.path.as_str() {
            "/ok" => {
                let n = state.probes.fetch_add(1, Ordering::SeqCst);
                if n < healthy_after {
                    Err(GatewayError::Connect("booting".to_string()))
                } else {
                    Ok(Bytes::new())
                }
            }
            "/hosting" => Ok(Bytes::from(
                state.hosting.load(Ordering::SeqCst).to_string(),
            )),
            "/host" => {
                bus.publish(LogEvent::info(id, "Loading map Caldera"));
                if !state.stuck.load(Ordering::SeqCst) {
                    state.hosting.store(true, Ordering::SeqCst);
                }
                Ok(Bytes::new())
            }
            "/commands" | "/say" | "/pause" => Ok(Bytes::new()),
            "/state" => {
                if state.broken_state.load(Ordering::SeqCst) {
                    return Err(GatewayError::BadRequest("/state timed out".to_string()));
                }
                let body = serde_json::json!({
                    "hosting": state.hosting.load(Ordering::SeqCst),
                    "players": state.players.load(Ordering::SeqCst),
                });
                Ok(Bytes::from(body.to_string()))
            }
            other => Err(GatewayError::Status {
                status: 404,
                path: other.to_string(),
            }),
        });
        fake
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
