//! Configuration management for the vethernet client

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{DEFAULT_KEEPALIVE_SECS, DEFAULT_PORT};

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server hostname or IP address
    pub server: String,

    /// Server port (default: 20000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client session identifier announced to the server
    pub client_id: u128,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u64,

    /// Drop outbound UDP to ports 80/443 (QUIC suppression policy)
    #[serde(default)]
    pub block_quic: bool,

    /// Bandwidth hint in kbps (0 = unlimited)
    #[serde(default)]
    pub bandwidth: u32,

    /// Physical interface route changes are pinned to (empty = kernel default)
    #[serde(default)]
    pub preferred_nic: String,

    /// Bypass IP-list files, one CIDR entry per line
    #[serde(default)]
    pub iplist_files: Vec<String>,

    /// Static reverse port-mapping rules
    #[serde(default)]
    pub mappings: Vec<MappingRule>,
}

/// A statically configured reverse port-forwarding rule carried
/// through the tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRule {
    /// True when the rule applies to the server's inbound side.
    #[serde(default = "default_true")]
    pub inbound: bool,
    /// Transport protocol, "tcp" or "udp".
    pub transport: Transport,
    /// Port registered on the remote peer.
    pub remote_port: u16,
    /// Local address the mapped traffic is delivered to.
    pub local_address: String,
    /// Local port the mapped traffic is delivered to.
    pub local_port: u16,
}

/// Transport selector for mapping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: ClientConfig = serde_json::from_str(&data).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.server.is_empty(), "server must not be empty");
        anyhow::ensure!(self.port != 0, "port must be non-zero");
        anyhow::ensure!(self.client_id != 0, "client_id must be non-zero");
        anyhow::ensure!(
            self.keepalive_interval >= 1,
            "keepalive_interval must be at least 1 second"
        );
        for m in &self.mappings {
            anyhow::ensure!(m.remote_port != 0, "mapping remote_port must be non-zero");
            anyhow::ensure!(m.local_port != 0, "mapping local_port must be non-zero");
        }
        Ok(())
    }

    /// The `host:port` pair handed to endpoint resolution.
    pub fn server_authority(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r#"{
            "server": "vpn.example.net",
            "client_id": 7
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.keepalive_interval, DEFAULT_KEEPALIVE_SECS);
        assert!(!config.block_quic);
        assert!(config.mappings.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_mapping_rules() {
        let json = r#"{
            "server": "vpn.example.net",
            "client_id": 7,
            "block_quic": true,
            "mappings": [
                { "transport": "tcp", "remote_port": 8022,
                  "local_address": "127.0.0.1", "local_port": 22 }
            ]
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert!(config.block_quic);
        assert_eq!(config.mappings.len(), 1);
        assert_eq!(config.mappings[0].transport, Transport::Tcp);
        assert!(config.mappings[0].inbound);
    }

    #[test]
    fn reject_zero_client_id() {
        let json = r#"{ "server": "vpn.example.net", "client_id": 0 }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
