// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Node configuration: an optional TOML file (`AMUN_CONFIG`), overridable by
//! environment variables so the binary stays friendly to container/systemd
//! deployments that set only a handful of env vars.

use serde::Deserialize;
use thiserror::Error;

/// Configuration load errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("read config file")]
    Read,
    /// The config file is not valid TOML for this schema.
    #[error("parse config file")]
    Parse,
}

/// Node configuration root.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and storage settings.
    pub node: NodeSettings,
    /// Metrics/health HTTP surface.
    pub http: HttpConfig,
    /// libp2p transport settings.
    pub p2p: P2pSettings,
    /// Optional signed peer registry to source the transport allowlist from.
    pub peer_registry: Option<PeerRegistryConfig>,
    /// Optional proxy role: this node forwards certificate traffic for a
    /// validator it does not itself sign for.
    pub proxy: Option<ProxyConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            http: HttpConfig::default(),
            p2p: P2pSettings::default(),
            peer_registry: None,
            proxy: None,
        }
    }
}

/// Node identity and storage settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Human-readable name, used only in logs.
    pub name: String,
    /// Data directory: keystore, libp2p identity, and the sled databases.
    pub data_dir: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self { name: "validator".to_string(), data_dir: "./data".to_string() }
    }
}

/// Metrics/health HTTP surface.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address, e.g. "0.0.0.0:9090".
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { listen_addr: "127.0.0.1:9090".to_string() }
    }
}

/// libp2p transport settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct P2pSettings {
    /// Listen multiaddr, e.g. "/ip4/0.0.0.0/tcp/4001".
    pub listen_addr: String,
    /// Dialable bootstrap multiaddrs (with trailing `/p2p/<peer id>`).
    pub bootstrap: Vec<String>,
    /// Static allowlist of peer ids. Ignored if `peer_registry` is set and
    /// loads successfully; falls back to this list otherwise.
    pub allow_peers: Vec<String>,
    /// Host this node's enode URL advertises to the rest of the mesh.
    /// `listen_addr`'s own host is usually a bind address (e.g. `0.0.0.0`),
    /// not something peers can dial.
    pub external_host: String,
}

impl Default for P2pSettings {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/4001".to_string(),
            bootstrap: Vec::new(),
            allow_peers: Vec::new(),
            external_host: "127.0.0.1".to_string(),
        }
    }
}

impl P2pSettings {
    /// Extract the TCP port from `listen_addr` (`/ip4/.../tcp/<port>`).
    pub fn listen_port(&self) -> Option<u16> {
        let idx = self.listen_addr.find("/tcp/")?;
        let rest = &self.listen_addr[idx + "/tcp/".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

/// Signed peer registry source.
#[derive(Clone, Debug, Deserialize)]
pub struct PeerRegistryConfig {
    /// Path to the registry TOML file.
    pub path: String,
    /// Hex-encoded Ed25519 public key the registry must verify against.
    pub pubkey_hex: String,
    /// Expected `network` field, rejecting cross-network rollback.
    pub network: String,
}

/// This node proxies certificate traffic for a validator it does not sign for.
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyConfig {
    /// The proxied validator's address (hex, `0x`-prefixed or not).
    pub proxied_validator_address: String,
}

fn env_override(key: &str, current: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *current = v;
    }
}

impl NodeConfig {
    /// Load from `path`, then apply a handful of env var overrides on top
    /// (`AMUN_DATA_DIR`, `AMUN_HTTP_ADDR`, `AMUN_P2P_LISTEN`).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
        let mut cfg: NodeConfig = toml::from_str(&raw).map_err(|_| ConfigError::Parse)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Build a config entirely from defaults plus env var overrides, for
    /// zero-config container/systemd deployments that set only env vars.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        env_override("AMUN_DATA_DIR", &mut self.node.data_dir);
        env_override("AMUN_HTTP_ADDR", &mut self.http.listen_addr);
        env_override("AMUN_P2P_LISTEN", &mut self.p2p.listen_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node.data_dir, "./data");
        assert!(cfg.p2p.bootstrap.is_empty());
    }

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            [node]
            name = "v1"
            data_dir = "/srv/amunchain/v1/data"

            [p2p]
            listen_addr = "/ip4/0.0.0.0/tcp/4001"
            bootstrap = ["/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWLh9S2QyVMgQgHmuzu2tCA6KsL9mpNgnvoiA1SQ9nHnMA"]
        "#;
        let cfg: NodeConfig = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.node.name, "v1");
        assert_eq!(cfg.p2p.bootstrap.len(), 1);
        assert_eq!(cfg.http.listen_addr, "127.0.0.1:9090");
    }

    #[test]
    fn listen_port_parses_tcp_multiaddr() {
        let p2p = P2pSettings { listen_addr: "/ip4/0.0.0.0/tcp/4007".to_string(), ..P2pSettings::default() };
        assert_eq!(p2p.listen_port(), Some(4007));
    }
}
