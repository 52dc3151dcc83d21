//! fleetd.toml configuration parser.
//!
//! Every section and field is optional; omitted values take the defaults
//! below. Durations are written as strings ("500ms", "10s", "5m") or bare
//! numbers of seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub instance: InstanceSettings,
    pub gateway: GatewaySettings,
    pub controller: ControllerSettings,
}

/// Container provisioning and log reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstanceSettings {
    /// Image used when a `ServerConfig` names none.
    pub default_image: String,
    /// Root of the per-instance host directories.
    pub data_dir: PathBuf,
    /// Container network the control endpoints are reachable on.
    pub network: Option<String>,
    #[serde(with = "duration_str")]
    pub reconcile_interval: Duration,
    /// CFS accounting period in microseconds.
    pub cpu_period: i64,
    /// Max size of one json-file log before rotation ("10m").
    pub log_max_size: String,
    pub log_max_files: u32,
    pub stop_timeout_secs: i64,
    /// Game port inside the container.
    pub game_port: u16,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            default_image: "ghcr.io/fleet/game-server:latest".to_string(),
            data_dir: PathBuf::from("/var/lib/fleetd"),
            network: Some("fleet".to_string()),
            reconcile_interval: Duration::from_secs(60),
            cpu_period: 100_000,
            log_max_size: "10m".to_string(),
            log_max_files: 3,
            stop_timeout_secs: 10,
            game_port: 6567,
        }
    }
}

/// Control-endpoint connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    /// Port of the control endpoint inside each container.
    pub control_port: u16,
    /// Event-stream subscription attempts before the instance is declared dead.
    pub retry_attempts: u32,
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    /// Longest silence (no event, no heartbeat) tolerated on the event stream.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Timeout for heavy calls (host, image).
    #[serde(with = "duration_str")]
    pub host_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            control_port: 9999,
            retry_attempts: 20,
            retry_delay: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            host_timeout: Duration::from_secs(30),
        }
    }
}

/// Host sequencing and background loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerSettings {
    #[serde(with = "duration_str")]
    pub reap_interval: Duration,
    #[serde(with = "duration_str")]
    pub attach_interval: Duration,
    /// Consecutive idle observations before an instance is removed.
    pub reap_strikes: u32,
    /// Extra attempts for a failed state query during reaping.
    pub reap_query_retries: u32,
    /// Pause between those attempts.
    #[serde(with = "duration_str")]
    pub reap_query_delay: Duration,
    pub health_attempts: u32,
    #[serde(with = "duration_str")]
    pub health_delay: Duration,
    pub host_poll_attempts: u32,
    #[serde(with = "duration_str")]
    pub host_poll_delay: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(5 * 60),
            attach_interval: Duration::from_secs(5),
            reap_strikes: 2,
            reap_query_retries: 2,
            reap_query_delay: Duration::from_secs(1),
            health_attempts: 60,
            health_delay: Duration::from_secs(1),
            host_poll_attempts: 50,
            host_poll_delay: Duration::from_millis(200),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "5s", "500ms", "2m", or "10".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: &Duration) -> String {
    let ms = d.as_millis();
    if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(t) => super::parse_duration(&t)
                .ok_or_else(|| de::Error::custom(format!("invalid duration: {t:?}"))),
        }
    }
}
