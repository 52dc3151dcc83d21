//! fleetd — the fleet daemon.
//!
//! Single binary that assembles the fleet subsystems:
//! - Event bus
//! - Instance manager (Docker via bollard)
//! - Gateway connection manager (HTTP/SSE)
//! - Fleet controller (host sequence, idle reaper, attach loop)
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleetd.toml run
//! fleetd --config /etc/fleetd.toml host server.toml
//! fleetd list
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use fleet_controller::FleetController;
use fleet_core::{FleetConfig, LogLevel, ServerConfig};
use fleet_events::EventBus;
use fleet_gateway::HttpTransport;
use fleet_instance::DockerEngine;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet daemon")]
struct Cli {
    /// Path to fleetd.toml; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every background loop until Ctrl-C.
    Run,

    /// Host one server from a TOML server config.
    Host {
        /// ServerConfig file.
        server: PathBuf,
    },

    /// List managed servers.
    List,

    /// Remove one server.
    Remove { id: Uuid },

    /// Stream resource usage of one server until Ctrl-C.
    Usage { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    let controller = assemble(&config)?;

    match cli.command {
        Command::Run => run(controller).await,
        Command::Host { server } => host(controller, &server).await,
        Command::List => list(controller).await,
        Command::Remove { id } => {
            controller.remove(id).await?;
            println!("removed {id}");
            Ok(())
        }
        Command::Usage { id } => usage(controller, id).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn assemble(config: &FleetConfig) -> anyhow::Result<FleetController> {
    let engine = DockerEngine::connect()?;
    let transport = HttpTransport::new(config.gateway.control_port);
    Ok(FleetController::assemble(
        Arc::new(engine),
        Arc::new(transport),
        EventBus::new(),
        config,
    ))
}

async fn run(controller: FleetController) -> anyhow::Result<()> {
    info!("fleet daemon starting");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Log reconciliation + engine event listener.
    let instances = controller.instances().clone();
    let instances_shutdown = shutdown_rx.clone();
    let instances_handle = tokio::spawn(async move {
        instances.run(instances_shutdown).await;
    });

    // Attach loop + idle reaper.
    let fleet = controller.clone();
    let controller_handle = tokio::spawn(async move {
        fleet.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    let _ = instances_handle.await;
    let _ = controller_handle.await;

    info!("fleet daemon stopped");
    Ok(())
}

async fn host(controller: FleetController, path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let server: ServerConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;

    // Follow container output so it shows up in the sequence.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let instances = controller.instances().clone();
    let follower = tokio::spawn(async move { instances.run(shutdown_rx).await });

    let mut failed = false;
    let mut events = controller.host(server);
    while let Some(event) = events.next().await {
        let level = match event.level {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => {
                failed = true;
                "error"
            }
        };
        println!("{} [{level}] {}", event.at.format("%H:%M:%S"), event.message);
    }

    let _ = shutdown_tx.send(true);
    let _ = follower.await;

    if failed {
        bail!("host sequence failed");
    }
    Ok(())
}

async fn list(controller: FleetController) -> anyhow::Result<()> {
    let default_image = controller.instances().settings().default_image.clone();
    for state in controller.list().await? {
        let config = &state.meta.config;
        println!(
            "{}  {:<7}  port={}  image={}  name={}",
            state.id,
            if state.running { "running" } else { "stopped" },
            config.port,
            config.image_or(&default_image),
            config.name,
        );
    }
    Ok(())
}

async fn usage(controller: FleetController, id: Uuid) -> anyhow::Result<()> {
    let mut samples = controller.usage(id).await?;
    loop {
        tokio::select! {
            sample = samples.next() => match sample {
                Some(u) => println!(
                    "{} cpu={:.1}% ram={:.1}MiB",
                    u.at.format("%H:%M:%S"),
                    u.cpu,
                    u.ram as f64 / (1024.0 * 1024.0)
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
