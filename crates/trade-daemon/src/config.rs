//! Daemon configuration: transport and identity settings layered on top of
//! the protocol settings, all read from the same TOML file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use trade_protocol::config::ProtocolConfig;

#[derive(Debug, Deserialize)]
struct DaemonToml {
    #[serde(default)]
    party_id: Option<String>,
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
    #[serde(default = "default_explorer_url")]
    explorer_url: String,
    #[serde(default, rename = "peer")]
    peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize)]
struct PeerEntry {
    id: String,
    addr: String,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub protocol: ProtocolConfig,
    /// Our own peer id, announced to counterparties
    pub party_id: String,
    pub listen_addr: String,
    pub explorer_url: String,
    /// Known counterparties: peer id -> host:port
    pub peers: HashMap<String, String>,
}

impl DaemonConfig {
    /// Load from TOML with env overrides (TRADE_PARTY_ID, TRADE_LISTEN_ADDR,
    /// TRADE_EXPLORER_URL). The protocol section is parsed from the same
    /// file by [`ProtocolConfig::load`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => toml::from_str::<DaemonToml>(&contents)
                .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                toml::from_str::<DaemonToml>("").expect("empty config has defaults")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.as_ref().display()))
            }
        };

        let party_id = match std::env::var("TRADE_PARTY_ID").ok().or(raw.party_id) {
            Some(id) if !id.is_empty() => id,
            _ => bail!("party_id is required (set it in the config file or TRADE_PARTY_ID)"),
        };
        let listen_addr = std::env::var("TRADE_LISTEN_ADDR").unwrap_or(raw.listen_addr);
        let explorer_url = std::env::var("TRADE_EXPLORER_URL").unwrap_or(raw.explorer_url);

        Ok(Self {
            protocol: ProtocolConfig::load(path)?,
            party_id,
            listen_addr,
            explorer_url,
            peers: raw.peers.into_iter().map(|p| (p.id, p.addr)).collect(),
        })
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_explorer_url() -> String {
    "https://mempool.space".to_string()
}
