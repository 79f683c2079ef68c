//! Protocol service configuration
//!
//! Loaded from an optional TOML file with serde defaults, plus env var
//! overrides for deployment-specific paths. The daemon wraps this with its
//! own transport settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Raw TOML shape with defaults
#[derive(Debug, Deserialize)]
struct ProtocolToml {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default = "default_poll_base_secs")]
    poll_base_secs: u64,
    #[serde(default = "default_poll_cap_secs")]
    poll_cap_secs: u64,
    #[serde(default = "default_startup_timeout_secs")]
    startup_timeout_secs: u64,
    #[serde(default = "default_send_drain_timeout_secs")]
    send_drain_timeout_secs: u64,
}

/// Settings for the protocol service
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Directory holding the durable trade records
    pub data_dir: PathBuf,
    /// Base interval for confirmation polling
    pub poll_base: Duration,
    /// Backoff ceiling for confirmation polling
    pub poll_cap: Duration,
    /// Aggregate bound on `initialize`; exceeded means fail, not hang
    pub startup_timeout: Duration,
    /// How long shutdown waits for in-flight outbound sends
    pub send_drain_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poll_base: Duration::from_secs(default_poll_base_secs()),
            poll_cap: Duration::from_secs(default_poll_cap_secs()),
            startup_timeout: Duration::from_secs(default_startup_timeout_secs()),
            send_drain_timeout: Duration::from_secs(default_send_drain_timeout_secs()),
        }
    }
}

impl ProtocolConfig {
    /// Load from a TOML file; a missing file yields pure defaults.
    /// `TRADE_DATA_DIR` overrides the record directory either way.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => toml::from_str::<ProtocolToml>(&contents)
                .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                toml::from_str::<ProtocolToml>("").expect("empty config has defaults")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.as_ref().display()))
            }
        };

        let data_dir = std::env::var("TRADE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(raw.data_dir);

        Ok(Self {
            data_dir,
            poll_base: Duration::from_secs(raw.poll_base_secs),
            poll_cap: Duration::from_secs(raw.poll_cap_secs),
            startup_timeout: Duration::from_secs(raw.startup_timeout_secs),
            send_drain_timeout: Duration::from_secs(raw.send_drain_timeout_secs),
        })
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/trades")
}

fn default_poll_base_secs() -> u64 {
    20
}

fn default_poll_cap_secs() -> u64 {
    300
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_send_drain_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.poll_base, Duration::from_secs(20));
        assert_eq!(config.poll_cap, Duration::from_secs(300));
        assert_eq!(config.startup_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = ProtocolConfig::load("/nonexistent/trade.toml").unwrap();
        assert_eq!(config.poll_base, Duration::from_secs(20));
    }

    #[test]
    fn test_toml_overrides() {
        let dir = std::env::temp_dir().join(format!("trade-config-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("trade.toml");
        std::fs::write(&path, "poll_base_secs = 5\npoll_cap_secs = 30\n").unwrap();

        let config = ProtocolConfig::load(&path).unwrap();
        assert_eq!(config.poll_base, Duration::from_secs(5));
        assert_eq!(config.poll_cap, Duration::from_secs(30));
        // Untouched fields keep defaults
        assert_eq!(config.startup_timeout, Duration::from_secs(60));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
