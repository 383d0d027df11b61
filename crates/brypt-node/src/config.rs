//! The typed runtime configuration.
//!
//! The core consumes this object as-is; reading it from a file and
//! validating command-line input belong to the outer program.

use std::path::PathBuf;
use std::time::Duration;

use brypt_types::Protocol;
use serde::{Deserialize, Serialize};

/// Complete configuration of one node runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The node's identifier in network form. Generated when absent.
    #[serde(default)]
    pub node_identifier: Option<String>,
    /// One entry per protocol the node should drive.
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
    /// The known-peers file the bootstrap cache mirrors to.
    #[serde(default = "default_peers_file")]
    pub peers_file: PathBuf,
    /// How long a staged request waits for responses, in milliseconds.
    #[serde(default = "default_awaitable_timeout_ms")]
    pub awaitable_timeout_ms: u64,
    /// How long idle endpoint workers park, in milliseconds.
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,
}

/// Per-protocol endpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// The protocol this entry drives.
    pub kind: Protocol,
    /// Local interface substituted for wildcard hosts on client-side
    /// connects.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Server binding authorities, e.g. `*:35216`.
    #[serde(default)]
    pub bindings: Vec<String>,
    /// Default bootstrap URIs to contact at startup.
    #[serde(default)]
    pub bootstraps: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_identifier: None,
            protocols: Vec::new(),
            peers_file: default_peers_file(),
            awaitable_timeout_ms: default_awaitable_timeout_ms(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
        }
    }
}

impl NodeConfig {
    pub fn awaitable_timeout(&self) -> Duration {
        Duration::from_millis(self.awaitable_timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }
}

fn default_peers_file() -> PathBuf {
    PathBuf::from("peers.json")
}

fn default_awaitable_timeout_ms() -> u64 {
    brypt_await::DEFAULT_AWAIT_TIMEOUT.as_millis() as u64
}

fn default_cycle_timeout_ms() -> u64 {
    brypt_network::CYCLE_TIMEOUT.as_millis() as u64
}

fn default_interface() -> String {
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_on_decode() {
        let config: NodeConfig = serde_json::from_str("{}").expect("decode");
        assert!(config.node_identifier.is_none());
        assert_eq!(config.peers_file, PathBuf::from("peers.json"));
        assert_eq!(config.awaitable_timeout(), Duration::from_millis(1500));
        assert_eq!(config.cycle_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_protocol_entry_decodes() {
        let config: NodeConfig = serde_json::from_str(
            r#"{
                "protocols": [
                    {
                        "kind": "tcp",
                        "bindings": ["*:35216"],
                        "bootstraps": ["tcp://127.0.0.1:35217"]
                    }
                ]
            }"#,
        )
        .expect("decode");
        assert_eq!(config.protocols.len(), 1);
        assert_eq!(config.protocols[0].kind, Protocol::Tcp);
        assert_eq!(config.protocols[0].interface, "127.0.0.1");
        assert_eq!(config.protocols[0].bindings, vec!["*:35216"]);
    }
}
