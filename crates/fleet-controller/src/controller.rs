//! The fleet controller.
//!
//! Composes the instance manager and the gateway: the host sequence, the
//! idle reaper, drift reports, the attach loop, and the per-server
//! operations the administrative surface calls.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_core::{
    ControllerSettings, FleetConfig, InstanceStatus, LogEvent, Player, PlayerUpdate, ServerConfig,
    ServerId, ServerMisMatch, ServerState,
};
use fleet_events::EventBus;
use fleet_gateway::{GatewayClient, GatewayManager, GatewayTransport, Target};
use fleet_instance::{ContainerEngine, InstanceManager, LogStream, UsageStream};

use crate::error::FleetResult;
use crate::host::host_sequence;
use crate::reaper::{KillFlag, Verdict};

/// Drives hosted servers through their lifecycle.
#[derive(Clone)]
pub struct FleetController {
    instances: InstanceManager,
    gateway: GatewayManager,
    bus: EventBus,
    settings: Arc<ControllerSettings>,
    /// Idle markers by server.
    flags: Arc<DashMap<ServerId, KillFlag>>,
    /// Host sequences in flight, by server.
    hosting: Arc<DashMap<ServerId, usize>>,
}

/// Marks a server as being hosted until dropped.
pub(crate) struct HostingGuard {
    hosting: Arc<DashMap<ServerId, usize>>,
    id: ServerId,
}

impl Drop for HostingGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.hosting.get_mut(&self.id) {
            *count -= 1;
        }
        self.hosting.remove_if(&self.id, |_, count| *count == 0);
    }
}

impl FleetController {
    pub fn new(
        instances: InstanceManager,
        gateway: GatewayManager,
        bus: EventBus,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            instances,
            gateway,
            bus,
            settings: Arc::new(settings),
            flags: Arc::new(DashMap::new()),
            hosting: Arc::new(DashMap::new()),
        }
    }

    /// Wire every subsystem from configuration.
    ///
    /// When a gateway connection gives up, the container it was opened
    /// against is removed, never a newer one of the same server.
    pub fn assemble(
        engine: Arc<dyn ContainerEngine>,
        transport: Arc<dyn GatewayTransport>,
        bus: EventBus,
        config: &FleetConfig,
    ) -> Self {
        let instances = InstanceManager::new(engine, bus.clone(), config.instance.clone());

        let remover = instances.clone();
        let gateway = GatewayManager::new(transport, bus.clone(), config.gateway.clone())
            .with_unreachable_handler(move |target: Target| {
                let instances = remover.clone();
                async move {
                    let id = target.server_id;
                    let removed = match &target.container {
                        Some(container) => instances.remove_container(id, container).await,
                        None => instances.remove(id).await.map(|()| true),
                    };
                    match removed {
                        Ok(true) => instances.detach_logs(id),
                        Ok(false) => {}
                        Err(e) => warn!(
                            server_id = %id,
                            error = %e,
                            "failed to remove unreachable server"
                        ),
                    }
                }
            });

        Self::new(instances, gateway, bus, config.controller.clone())
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn gateway(&self) -> &GatewayManager {
        &self.gateway
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Provision `config` and bring it to the hosting state.
    ///
    /// The sequence starts immediately and runs to completion even if the
    /// returned stream is dropped.
    pub fn host(&self, config: ServerConfig) -> LogStream {
        host_sequence(self.clone(), config)
    }

    pub(crate) fn begin_hosting(&self, id: ServerId) -> HostingGuard {
        *self.hosting.entry(id).or_insert(0) += 1;
        HostingGuard {
            hosting: self.hosting.clone(),
            id,
        }
    }

    /// Servers with a host sequence in flight.
    pub fn hosting(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.hosting.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Tear a server down: connection, log follower, container.
    pub async fn remove(&self, id: ServerId) -> FleetResult<()> {
        self.gateway.cancel(id);
        self.instances.detach_logs(id);
        self.flags.remove(&id);
        self.instances.remove(id).await?;
        Ok(())
    }

    pub async fn list(&self) -> FleetResult<Vec<ServerState>> {
        Ok(self.instances.list().await?)
    }

    /// Drift between `config` and the server, including what the running
    /// instance reports about itself when it is reachable.
    pub async fn get_mismatch(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> FleetResult<Vec<ServerMisMatch>> {
        let observed = match self.client(id).await?.state().await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(server_id = %id, error = %e, "instance state unavailable for mismatch");
                None
            }
        };
        Ok(self
            .instances
            .get_mismatch(id, config, observed.as_ref())
            .await?)
    }

    pub async fn usage(&self, id: ServerId) -> FleetResult<UsageStream> {
        Ok(self.instances.usage(id).await?)
    }

    /// The gateway client of a known server, bound to its current container.
    /// Unknown servers never get a connection.
    async fn client(&self, id: ServerId) -> FleetResult<GatewayClient> {
        let state = self.instances.get(id).await?;
        Ok(self.gateway.attach(id, &state.container_id))
    }

    pub async fn state(&self, id: ServerId) -> FleetResult<InstanceStatus> {
        Ok(self.client(id).await?.state().await?)
    }

    pub async fn raw_state(&self, id: ServerId) -> FleetResult<Value> {
        Ok(self.client(id).await?.raw_state().await?)
    }

    pub async fn players(&self, id: ServerId) -> FleetResult<Vec<Player>> {
        Ok(self.client(id).await?.players().await?)
    }

    pub async fn update_player(&self, id: ServerId, update: &PlayerUpdate) -> FleetResult<()> {
        Ok(self.client(id).await?.update_player(update).await?)
    }

    pub async fn send_commands(&self, id: ServerId, commands: &[String]) -> FleetResult<()> {
        Ok(self.client(id).await?.send_commands(commands).await?)
    }

    pub async fn say(&self, id: ServerId, message: &str) -> FleetResult<()> {
        Ok(self.client(id).await?.say(message).await?)
    }

    pub async fn pause(&self, id: ServerId) -> FleetResult<()> {
        Ok(self.client(id).await?.pause().await?)
    }

    pub async fn image(&self, id: ServerId) -> FleetResult<Bytes> {
        Ok(self.client(id).await?.image().await?)
    }

    pub async fn workflows(&self, id: ServerId) -> FleetResult<Value> {
        Ok(self.client(id).await?.workflows().await?)
    }

    pub async fn set_workflows(&self, id: ServerId, workflows: &Value) -> FleetResult<()> {
        Ok(self.client(id).await?.set_workflows(workflows).await?)
    }

    /// Make sure every running server has a gateway connection to its
    /// current container. Servers with a host sequence in flight are left to
    /// it. Returns how many connections were opened.
    pub async fn attach_all(&self) -> FleetResult<usize> {
        let mut opened = 0;
        for state in self.instances.list().await? {
            if !state.running || self.hosting.contains_key(&state.id) {
                continue;
            }
            if self.gateway.container_of(state.id).as_deref() != Some(&state.container_id) {
                self.gateway.attach(state.id, &state.container_id);
                opened += 1;
            }
        }
        if opened > 0 {
            debug!(count = opened, "attached gateway connections");
        }
        Ok(opened)
    }

    /// One pass of the idle reaper. Returns the servers removed.
    ///
    /// Failures for one server are published as error events and never
    /// stop the pass.
    pub async fn reap_idle(&self) -> FleetResult<Vec<ServerId>> {
        let states = self.instances.list().await?;
        self.flags
            .retain(|id, _| states.iter().any(|s| s.id == *id && s.running));

        let mut removed = Vec::new();
        for state in states
            .iter()
            .filter(|s| s.running && s.meta.config.auto_turn_off)
        {
            let id = state.id;
            let client = self.gateway.attach(id, &state.container_id);
            let players = match self.player_count(&client).await {
                Ok(players) => players,
                Err(e) => {
                    error!(server_id = %id, error = %e, "idle check failed");
                    self.bus.publish(LogEvent::error(id, format!("Idle check failed: {e}")));
                    continue;
                }
            };

            let flag = self.flags.get(&id).map(|f| *f).unwrap_or_default();
            let (next, verdict) = flag.observe(players, self.settings.reap_strikes);
            self.flags.insert(id, next);

            match verdict {
                Verdict::Keep => {}
                Verdict::Flag => {
                    info!(server_id = %id, "server idle, flagged for removal");
                }
                Verdict::Remove => {
                    info!(server_id = %id, "removing idle server");
                    match self.remove(id).await {
                        Ok(()) => removed.push(id),
                        Err(e) => {
                            error!(server_id = %id, error = %e, "failed to remove idle server");
                            self.bus
                                .publish(LogEvent::error(id, format!("Idle removal failed: {e}")));
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Current idle marker of a server.
    pub fn kill_flag(&self, id: ServerId) -> KillFlag {
        self.flags.get(&id).map(|f| *f).unwrap_or_default()
    }

    async fn player_count(&self, client: &GatewayClient) -> FleetResult<u32> {
        let mut attempt = 0;
        loop {
            match client.state().await {
                Ok(status) => return Ok(status.players),
                Err(e) if attempt < self.settings.reap_query_retries => {
                    attempt += 1;
                    debug!(
                        server_id = %client.server_id(),
                        attempt,
                        error = %e,
                        "retrying idle check"
                    );
                    tokio::time::sleep(self.settings.reap_query_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the attach loop and the idle reaper until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attach = tokio::time::interval(self.settings.attach_interval);
        attach.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.reap_interval,
            self.settings.reap_interval,
        );
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            attach_secs = self.settings.attach_interval.as_secs(),
            reap_secs = self.settings.reap_interval.as_secs(),
            "fleet controller started"
        );

        loop {
            tokio::select! {
                _ = attach.tick() => {
                    if let Err(e) = self.attach_all().await {
                        warn!(error = %e, "attach pass failed");
                    }
                }
                _ = reap.tick() => {
                    match self.reap_idle().await {
                        Ok(removed) if !removed.is_empty() => {
                            info!(count = removed.len(), "idle servers removed");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "idle reaper pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("fleet controller shutting down");
                    break;
                }
            }
        }

        self.gateway.shutdown();
    }
}
