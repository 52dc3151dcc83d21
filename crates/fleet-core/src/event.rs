//! Events published on the fleet event bus.
//!
//! Every event is timestamped and tagged with the server identity it
//! concerns. `LogEvent` doubles as the item type of the provisioning and
//! host sequences.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Player, ServerId};

/// Severity of a `LogEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A line of progress or output for one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub server_id: ServerId,
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(server_id: ServerId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            server_id,
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn info(server_id: ServerId, message: impl Into<String>) -> Self {
        Self::new(server_id, LogLevel::Info, message)
    }

    pub fn warn(server_id: ServerId, message: impl Into<String>) -> Self {
        Self::new(server_id, LogLevel::Warn, message)
    }

    pub fn error(server_id: ServerId, message: impl Into<String>) -> Self {
        Self::new(server_id, LogLevel::Error, message)
    }

    pub fn is_error(&self) -> bool {
        self.level == LogLevel::Error
    }
}

/// A server's container (re)started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartEvent {
    pub server_id: ServerId,
    pub at: DateTime<Utc>,
}

impl StartEvent {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            at: Utc::now(),
        }
    }
}

/// A server stopped or was torn down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopEvent {
    pub server_id: ServerId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl StopEvent {
    pub fn new(server_id: ServerId, reason: impl Into<String>) -> Self {
        Self {
            server_id,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Instantaneous resource usage of one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeUsage {
    pub server_id: ServerId,
    /// CPU usage in percent of one core (200.0 = two full cores).
    pub cpu: f64,
    /// RAM usage in bytes.
    pub ram: u64,
    pub at: DateTime<Utc>,
}

/// A player joined or left a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerEvent {
    pub server_id: ServerId,
    pub player: Player,
    pub at: DateTime<Utc>,
}

/// A chat line relayed from a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEvent {
    pub server_id: ServerId,
    pub player: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything that travels over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    Log(LogEvent),
    Start(StartEvent),
    Stop(StopEvent),
    Usage(NodeUsage),
    PlayerJoin(PlayerEvent),
    PlayerLeave(PlayerEvent),
    Chat(ChatEvent),
}

impl FleetEvent {
    pub fn server_id(&self) -> ServerId {
        match self {
            Self::Log(e) => e.server_id,
            Self::Start(e) => e.server_id,
            Self::Stop(e) => e.server_id,
            Self::Usage(e) => e.server_id,
            Self::PlayerJoin(e) | Self::PlayerLeave(e) => e.server_id,
            Self::Chat(e) => e.server_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Usage(_) => "usage",
            Self::PlayerJoin(_) => "player_join",
            Self::PlayerLeave(_) => "player_leave",
            Self::Chat(_) => "chat",
        }
    }

    pub fn as_log(&self) -> Option<&LogEvent> {
        match self {
            Self::Log(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LogEvent> for FleetEvent {
    fn from(e: LogEvent) -> Self {
        Self::Log(e)
    }
}

impl From<StartEvent> for FleetEvent {
    fn from(e: StartEvent) -> Self {
        Self::Start(e)
    }
}

impl From<StopEvent> for FleetEvent {
    fn from(e: StopEvent) -> Self {
        Self::Stop(e)
    }
}

impl From<NodeUsage> for FleetEvent {
    fn from(e: NodeUsage) -> Self {
        Self::Usage(e)
    }
}

impl fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(e) => write!(f, "[{}] {}", e.server_id, e.message),
            Self::Start(e) => write!(f, "[{}] started", e.server_id),
            Self::Stop(e) => write!(f, "[{}] stopped: {}", e.server_id, e.reason),
            Self::Usage(e) => write!(f, "[{}] cpu={:.1}% ram={}", e.server_id, e.cpu, e.ram),
            Self::PlayerJoin(e) => write!(f, "[{}] {} joined", e.server_id, e.player.name),
            Self::PlayerLeave(e) => write!(f, "[{}] {} left", e.server_id, e.player.name),
            Self::Chat(e) => write!(f, "[{}] <{}> {}", e.server_id, e.player, e.message),
        }
    }
}
