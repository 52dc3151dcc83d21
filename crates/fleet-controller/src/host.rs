//! The host sequence: provision, wait for health, start hosting.
//!
//! Stages run strictly in order and the first failure ends the sequence
//! with a single error event. While the sequence runs, log events other
//! components publish for the same server are tapped into the stream too,
//! and the attach loop leaves the server alone.

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use fleet_core::{FleetEvent, LogEvent, ServerConfig, ServerId};
use fleet_gateway::{GatewayClient, HostRequest};
use fleet_instance::LogStream;

use crate::controller::FleetController;
use crate::error::{FleetError, FleetResult};

/// Final event of a successful sequence.
pub const HOSTING_MESSAGE: &str = "Server is hosting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    AwaitHealthy,
    Host,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Create, Stage::AwaitHealthy, Stage::Host];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::AwaitHealthy => "await-healthy",
            Stage::Host => "host",
        }
    }
}

enum Flow {
    Next,
    /// Skip the remaining stages.
    Done,
}

struct Progress {
    id: ServerId,
    tx: UnboundedSender<LogEvent>,
}

impl Progress {
    fn info(&self, message: impl Into<String>) {
        let _ = self.tx.send(LogEvent::info(self.id, message));
    }

    fn forward(&self, event: LogEvent) {
        let _ = self.tx.send(event);
    }
}

pub(crate) fn host_sequence(controller: FleetController, config: ServerConfig) -> LogStream {
    let id = config.id;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let guard = controller.begin_hosting(id);

    let tap_tx = tx.clone();
    let tap = controller.bus().subscribe(move |event| {
        if let FleetEvent::Log(log) = event
            && log.server_id == id
        {
            let _ = tap_tx.send(log.clone());
        }
        Ok(())
    });

    tokio::spawn(async move {
        let progress = Progress { id, tx };
        let result = run_stages(&controller, &config, &progress).await;
        tap.unsubscribe();
        drop(guard);

        match result {
            Ok(()) => {
                info!(server_id = %id, "host sequence complete");
                progress.info(HOSTING_MESSAGE);
            }
            Err(e) => {
                warn!(server_id = %id, error = %e, "host sequence failed");
                progress.forward(LogEvent::error(id, e.to_string()));
            }
        }
    });

    Box::pin(UnboundedReceiverStream::new(rx))
}

async fn run_stages(
    controller: &FleetController,
    config: &ServerConfig,
    progress: &Progress,
) -> FleetResult<()> {
    let mut client = None;
    for stage in Stage::ALL {
        debug!(server_id = %config.id, stage = stage.name(), "host stage starting");
        let flow = match stage {
            Stage::Create => create(controller, config, progress).await?,
            Stage::AwaitHealthy => {
                client = Some(await_healthy(controller, config.id, progress).await?);
                Flow::Next
            }
            Stage::Host => match &client {
                Some(client) => host(controller, client, config, progress).await?,
                None => return Err(FleetError::HealthTimeout(config.id)),
            },
        };
        if let Flow::Done = flow {
            break;
        }
    }
    Ok(())
}

async fn create(
    controller: &FleetController,
    config: &ServerConfig,
    progress: &Progress,
) -> FleetResult<Flow> {
    // The previous container's connection must not outlive it.
    controller.gateway().cancel(config.id);

    let mut events = controller.instances().create(config.clone());
    while let Some(event) = events.next().await {
        if event.is_error() {
            return Err(FleetError::Provisioning(event.message));
        }
        progress.forward(event);
    }
    Ok(Flow::Next)
}

async fn await_healthy(
    controller: &FleetController,
    id: ServerId,
    progress: &Progress,
) -> FleetResult<GatewayClient> {
    let settings = controller.settings();
    let state = controller.instances().get(id).await?;
    let client = controller.gateway().attach(id, &state.container_id);
    progress.info("Waiting for server to become reachable");

    for attempt in 1..=settings.health_attempts {
        match client.ok().await {
            Ok(()) => {
                progress.info("Server is reachable");
                return Ok(client);
            }
            Err(e) => {
                debug!(server_id = %id, attempt, error = %e, "health probe failed");
                tokio::time::sleep(settings.health_delay).await;
            }
        }
    }
    Err(FleetError::HealthTimeout(id))
}

async fn host(
    controller: &FleetController,
    client: &GatewayClient,
    config: &ServerConfig,
    progress: &Progress,
) -> FleetResult<Flow> {
    let settings = controller.settings();

    if client.is_hosting().await? {
        progress.info("Server is already hosting");
        return Ok(Flow::Done);
    }

    progress.info("Configuring server");
    client.send_commands(&pre_host_commands(config)).await?;

    progress.info(format!("Hosting {} ({})", config.name, config.mode));
    client.host(&HostRequest::from(config)).await?;

    for attempt in 1..=settings.host_poll_attempts {
        match client.is_hosting().await {
            Ok(true) => return Ok(Flow::Next),
            Ok(false) => {}
            Err(e) => debug!(server_id = %config.id, attempt, error = %e, "hosting poll failed"),
        }
        tokio::time::sleep(settings.host_poll_delay).await;
    }
    Err(FleetError::HostTimeout(config.id))
}

/// Console commands sent before hosting.
pub fn pre_host_commands(config: &ServerConfig) -> Vec<String> {
    vec![
        format!("config name {}", config.name),
        format!("config desc {}", config.description),
        "version".to_string(),
    ]
}
