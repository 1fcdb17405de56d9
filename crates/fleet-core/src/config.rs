//! fleet.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);
const MIN_PING_MULTIPLIER: f64 = 1.0;
const MAX_PING_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub ownership: OwnershipConfig,
    pub heartbeat: HeartbeatConfig,
    pub agent: AgentConfig,
}

/// Identity of this management-server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub msid: u64,
    pub name: String,
    pub data_dir: PathBuf,
}

/// Ownership partitioning pass parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    /// How often each process runs a partitioning pass.
    pub scan_interval: String,
    /// A `lastPinged` older than this is evidence the owner or host is gone.
    pub liveness_timeout: String,
    /// Maximum hosts claimed per pass.
    pub batch_limit: usize,
}

/// Management-server heartbeat parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval: String,
    /// A peer whose heartbeat row is older than this is presumed dead.
    pub peer_timeout: String,
}

/// Host supervision parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub ping_interval: String,
    pub ping_timeout_multiplier: f64,
    /// How far `lastPinged` is pushed back when the owning process is declared down.
    pub ms_down_ping_pushback: String,
    /// Re-read/re-decide attempts before a transition request gives up.
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            msid: 1,
            name: "fleet-ms-1".to_string(),
            data_dir: PathBuf::from("/var/lib/fleet"),
        }
    }
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            scan_interval: "10s".to_string(),
            liveness_timeout: "60s".to_string(),
            batch_limit: 50,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            peer_timeout: "30s".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ping_interval: "60s".to_string(),
            ping_timeout_multiplier: 2.5,
            ms_down_ping_pushback: "600s".to_string(),
            max_retries: 3,
        }
    }
}

impl OwnershipConfig {
    pub fn scan_interval(&self) -> Duration {
        parse_duration(&self.scan_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn liveness_timeout(&self) -> Duration {
        parse_duration(&self.liveness_timeout).unwrap_or(Duration::from_secs(60))
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn peer_timeout(&self) -> Duration {
        parse_duration(&self.peer_timeout).unwrap_or(Duration::from_secs(30))
    }
}

impl AgentConfig {
    pub fn ping_interval(&self) -> Duration {
        parse_duration(&self.ping_interval).unwrap_or(Duration::from_secs(60))
    }

    /// Silence after which an owned host is considered to have missed its pings.
    pub fn ping_timeout(&self) -> Duration {
        let secs = self.ping_interval().as_secs_f64() * self.ping_timeout_multiplier.max(1.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn ms_down_ping_pushback(&self) -> Duration {
        parse_duration(&self.ms_down_ping_pushback).unwrap_or(Duration::from_secs(600))
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would break ownership failover.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("ownership.scan_interval", &self.ownership.scan_interval),
            ("ownership.liveness_timeout", &self.ownership.liveness_timeout),
            ("heartbeat.interval", &self.heartbeat.interval),
            ("heartbeat.peer_timeout", &self.heartbeat.peer_timeout),
            ("agent.ping_interval", &self.agent.ping_interval),
            ("agent.ms_down_ping_pushback", &self.agent.ms_down_ping_pushback),
        ] {
            match parse_duration(value) {
                None => bail!("{field}: invalid duration {value:?}"),
                Some(d) if d.is_zero() => bail!("{field} must be greater than zero"),
                Some(d) if d > MAX_DURATION => bail!("{field} must be at most 365 days"),
                Some(_) => {}
            }
        }
        let multiplier = self.agent.ping_timeout_multiplier;
        if !(MIN_PING_MULTIPLIER..=MAX_PING_MULTIPLIER).contains(&multiplier) {
            bail!(
                "agent.ping_timeout_multiplier must be between {MIN_PING_MULTIPLIER} and \
                 {MAX_PING_MULTIPLIER}, got {multiplier}"
            );
        }
        if self.ownership.batch_limit == 0 {
            bail!("ownership.batch_limit must be at least 1");
        }
        if self.heartbeat.peer_timeout() <= self.heartbeat.interval() {
            bail!("heartbeat.peer_timeout must exceed heartbeat.interval");
        }
        // A pushed-back host must land behind the liveness deadline.
        if self.agent.ms_down_ping_pushback() < self.ownership.liveness_timeout() {
            bail!("agent.ms_down_ping_pushback must be at least ownership.liveness_timeout");
        }
        Ok(())
    }

    /// Scaffold a config for the given management-server id.
    pub fn scaffold(msid: u64, data_dir: &Path) -> Self {
        FleetConfig {
            server: ServerConfig {
                msid,
                name: format!("fleet-ms-{msid}"),
                data_dir: data_dir.to_path_buf(),
            },
            ..Default::default()
        }
    }
}
