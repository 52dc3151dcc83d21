//! Domain types for hosted servers.
//!
//! `ServerConfig` is declared intent, `ServerMetadata` is what was actually
//! provisioned (stored as a container label), `ServerState` is an observed
//! snapshot. The instance-reported types at the bottom mirror the JSON the
//! control endpoint inside each container returns.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of one hosted server, independent of container ID.
pub type ServerId = Uuid;

/// Label carrying the plain server identity, used for fast lookup.
pub const ID_LABEL: &str = "fleet.server.id";

/// Label carrying the JSON-encoded `ServerMetadata`.
pub const METADATA_LABEL: &str = "fleet.server.metadata";

/// Current `ServerMetadata` schema version.
pub const METADATA_VERSION: u32 = 1;

// ── Declared intent ───────────────────────────────────────────────

/// CPU and memory allotted to one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePlan {
    /// CPU share in cores (1.5 = one and a half cores).
    pub cpu: f64,
    /// RAM limit in megabytes.
    pub ram_mb: u64,
}

/// Declared configuration for one hosted server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Game mode passed to the host request.
    #[serde(default)]
    pub mode: String,
    /// Container image; `None` falls back to the configured default.
    #[serde(default)]
    pub image: Option<String>,
    /// Host port the game port is published on.
    pub port: u16,
    pub plan: ResourcePlan,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Tear the instance down when nobody is playing.
    #[serde(default)]
    pub auto_turn_off: bool,
    #[serde(default)]
    pub is_hub: bool,
    /// Console command used instead of the default host request.
    #[serde(default)]
    pub host_command: Option<String>,
    /// Mod identifiers the instance is expected to load.
    #[serde(default)]
    pub mods: Vec<String>,
}

impl ServerConfig {
    /// The image to run, falling back to `default_image`.
    pub fn image_or<'a>(&'a self, default_image: &'a str) -> &'a str {
        self.image.as_deref().unwrap_or(default_image)
    }
}

// ── Provisioned record ────────────────────────────────────────────

/// What the daemon actually provisioned for a server.
///
/// Serialized into the container's label set. Decoding ignores unknown
/// fields and defaults a missing `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMetadata {
    #[serde(default = "default_metadata_version")]
    pub version: u32,
    pub config: ServerConfig,
    /// Content hash of the image at creation time.
    pub image_hash: String,
}

fn default_metadata_version() -> u32 {
    METADATA_VERSION
}

impl ServerMetadata {
    pub fn new(config: ServerConfig, image_hash: impl Into<String>) -> Self {
        Self {
            version: METADATA_VERSION,
            config,
            image_hash: image_hash.into(),
        }
    }

    /// Encode for the metadata label.
    pub fn to_label(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a metadata label value.
    pub fn from_label(value: &str) -> serde_json::Result<Self> {
        serde_json::from_str(value)
    }
}

/// Observed snapshot of one managed container.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    pub id: ServerId,
    pub container_id: String,
    pub running: bool,
    pub meta: ServerMetadata,
}

/// One divergence between declared configuration and observed reality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerMisMatch {
    pub field: String,
    pub actual: String,
    pub expected: String,
}

impl ServerMisMatch {
    pub fn new(field: impl Into<String>, actual: impl ToString, expected: impl ToString) -> Self {
        Self {
            field: field.into(),
            actual: actual.to_string(),
            expected: expected.to_string(),
        }
    }
}

impl fmt::Display for ServerMisMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {}",
            self.field, self.expected, self.actual
        )
    }
}

// ── Instance-reported ─────────────────────────────────────────────

/// A mod loaded inside an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ModInfo {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// A connected player as reported by the control endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Player {
    pub uuid: String,
    pub name: String,
    pub ip: Option<String>,
    pub team: Option<String>,
    pub is_admin: bool,
}

/// Partial update of one player's record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
}

/// Structured state of a running instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceStatus {
    pub hosting: bool,
    pub paused: bool,
    pub players: u32,
    pub map_name: Option<String>,
    pub mode: Option<String>,
    pub version: Option<String>,
    pub tps: Option<f64>,
    pub mods: Vec<ModInfo>,
}
