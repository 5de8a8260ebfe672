/// Link and daemon configuration.
///
/// Every timing constant of the protocol is overridable. Files are YAML and
/// every field falls back to its default when omitted.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::Role;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Protocol timing (`link.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Interval between HELLO announcements.
    pub hello_period_ms: u64,
    /// Interval between heartbeat probes.
    pub heartbeat_period_ms: u64,
    /// Extra silence tolerated before a probe window counts as missed.
    pub heartbeat_grace_ms: u64,
    /// Consecutive missed windows before the peer is forgotten.
    pub miss_threshold: u8,
    /// First reconnection delay, restored after a successful association.
    pub backoff_floor_ms: u32,
    /// Upper bound for the reconnection delay.
    pub backoff_ceiling_ms: u32,
    /// Default ack-wait window for `AckMode::Wait`.
    pub ack_timeout_ms: u64,
    /// Sleep between scheduling passes while waiting for an ack.
    pub wait_poll_ms: u64,
    /// Outstanding `AckMode::Async` commands remembered at once.
    pub max_outstanding_acks: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            hello_period_ms: crate::HELLO_PERIOD_MS,
            heartbeat_period_ms: crate::HEARTBEAT_PERIOD_MS,
            heartbeat_grace_ms: crate::HEARTBEAT_GRACE_MS,
            miss_threshold: crate::MISS_THRESHOLD,
            backoff_floor_ms: crate::BACKOFF_FLOOR_MS,
            backoff_ceiling_ms: crate::BACKOFF_CEILING_MS,
            ack_timeout_ms: crate::ACK_TIMEOUT_MS,
            wait_poll_ms: 5,
            max_outstanding_acks: 8,
        }
    }
}

impl LinkConfig {
    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hello_period_ms == 0 || self.heartbeat_period_ms == 0 {
            return Err(ConfigError::Invalid("periods must be non-zero".to_string()));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::Invalid("miss_threshold must be at least 1".to_string()));
        }
        if self.backoff_floor_ms == 0 || self.backoff_floor_ms > self.backoff_ceiling_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff floor {} must be non-zero and not above ceiling {}",
                self.backoff_floor_ms, self.backoff_ceiling_ms
            )));
        }
        Ok(())
    }

    /// Silence after which one probe window counts as missed.
    pub fn probe_window_ms(&self) -> u64 {
        self.heartbeat_period_ms + self.heartbeat_grace_ms
    }
}

/// UDP transport settings (`udp.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Multicast rendezvous group.
    pub discovery_group: Ipv4Addr,
    /// Port for HELLO traffic.
    pub discovery_port: u16,
    /// Port for PING/PONG/CMD/ACK traffic.
    pub message_port: u16,
    /// Also broadcast HELLO to 255.255.255.255 when the multicast send fails.
    pub broadcast_fallback: bool,
    /// Unicast HELLO to this resolved host name instead of multicasting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_host: Option<String>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            discovery_group: crate::DISCOVERY_GROUP,
            discovery_port: crate::DISCOVERY_PORT,
            message_port: crate::MESSAGE_PORT,
            broadcast_fallback: true,
            peer_host: None,
        }
    }
}

/// Root configuration for the `peerlink` daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// This device's role.
    #[serde(default = "DaemonConfig::default_role")]
    pub role: Role,

    /// Hardware address used to derive the device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub udp: UdpConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            role: Self::default_role(),
            mac: None,
            link: LinkConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

impl DaemonConfig {
    fn default_role() -> Role {
        Role::remote()
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.link.validate()?;
        Ok(config)
    }

    /// Serialize the effective configuration.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
