//! Configuration system for meshlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshlink/config.toml
//!   3. ~/.config/meshlink/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{NodeId, DEFAULT_MAX_PACKET_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshlinkConfig {
    pub node: NodeConfig,
    pub transport: TransportConfig,
    /// Peers the daemon can address by id.
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id. Must be non-zero and unique in the network.
    pub id: NodeId,
    /// UDP address to bind.
    pub listen: SocketAddr,
    /// Path to the 64-byte identity secret. Auto-generated on first run.
    pub identity_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest datagram this node emits, header included.
    pub max_packet_size: usize,
    /// Sweeper period.
    pub retransmit_interval_ms: u64,
    /// Transmissions of one block before it is abandoned.
    pub max_send_attempts: u32,
    /// Partial inbound blocks older than this are dropped.
    pub reassembly_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Hex of the peer's 64-byte public identity.
    pub public_key: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeshlinkConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            transport: TransportConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            listen: SocketAddr::from(([0, 0, 0, 0], 7400)),
            identity_path: config_dir().join("identity"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            retransmit_interval_ms: 250,
            max_send_attempts: 20,
            reassembly_timeout_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("meshlink")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshlinkConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshlinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the transport cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id == 0 {
            return Err(ConfigError::Invalid("node.id must be non-zero".into()));
        }
        if self.transport.max_packet_size <= crate::wire::PACKET_HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "transport.max_packet_size must exceed {} header bytes",
                crate::wire::PACKET_HEADER_LEN
            )));
        }
        if self.transport.max_packet_size > crate::wire::MAX_DATAGRAM {
            return Err(ConfigError::Invalid(format!(
                "transport.max_packet_size must not exceed {} bytes, the largest UDP payload",
                crate::wire::MAX_DATAGRAM
            )));
        }
        if self.transport.max_send_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_send_attempts must be at least 1".into(),
            ));
        }
        if self.transport.retransmit_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.retransmit_interval_ms must be non-zero".into(),
            ));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.id == 0 || p.id == self.node.id) {
            return Err(ConfigError::Invalid(format!("peer id {} is not usable", peer.id)));
        }
        Ok(())
    }

    pub fn peer(&self, id: NodeId) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Apply MESHLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESHLINK_NODE__ID") {
            if let Ok(id) = v.parse() {
                self.node.id = id;
            }
        }
        if let Ok(v) = std::env::var("MESHLINK_NODE__LISTEN") {
            if let Ok(addr) = v.parse() {
                self.node.listen = addr;
            }
        }
        if let Ok(v) = std::env::var("MESHLINK_TRANSPORT__MAX_PACKET_SIZE") {
            if let Ok(n) = v.parse() {
                self.transport.max_packet_size = n;
            }
        }
        if let Ok(v) = std::env::var("MESHLINK_TRANSPORT__MAX_SEND_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.transport.max_send_attempts = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MeshlinkConfig::default();
        assert_eq!(config.transport.max_packet_size, 512);
        assert_eq!(config.transport.max_send_attempts, 20);
        assert_eq!(config.transport.retransmit_interval(), Duration::from_millis(250));
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_file_with_peers() {
        let text = r#"
            [node]
            id = 7
            listen = "127.0.0.1:9000"

            [transport]
            max_packet_size = 1200

            [[peers]]
            id = 8
            addr = "127.0.0.1:9001"
            public_key = "abcd"
        "#;
        let config = MeshlinkConfig::from_toml(text).unwrap();
        assert_eq!(config.node.id, 7);
        assert_eq!(config.node.listen.port(), 9000);
        assert_eq!(config.transport.max_packet_size, 1200);
        // Unset fields fall back to defaults.
        assert_eq!(config.transport.max_send_attempts, 20);
        assert_eq!(config.peer(8).unwrap().public_key, "abcd");
        assert!(config.peer(9).is_none());
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut config = MeshlinkConfig::default();
        config.node.id = 0;
        assert!(config.validate().is_err());

        let mut config = MeshlinkConfig::default();
        config.transport.max_packet_size = 28;
        assert!(config.validate().is_err());

        let mut config = MeshlinkConfig::default();
        config.transport.max_packet_size = crate::wire::MAX_DATAGRAM + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.transport.max_packet_size = crate::wire::MAX_DATAGRAM;
        config.validate().unwrap();

        let mut config = MeshlinkConfig::default();
        config.peers.push(PeerConfig {
            id: config.node.id,
            addr: "127.0.0.1:1".parse().unwrap(),
            public_key: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("meshlink-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("MESHLINK_CONFIG", config_path.to_str().unwrap());
        }

        let path =
            MeshlinkConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = MeshlinkConfig::load().expect("load should succeed");
        assert_eq!(config.transport.max_packet_size, 512);

        unsafe {
            std::env::remove_var("MESHLINK_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
