use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use shroud_core::ProtocolConfig;
use tracing::warn;

/// Returns the ~/.shroud directory, creating it if needed. Falls back to a
/// local `.shroud` directory if the home directory cannot be determined.
pub fn shroud_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(mut path) => {
            path.push(".shroud");
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(error = %e, "could not create ~/.shroud, falling back to local .shroud");
                let fallback = PathBuf::from(".shroud");
                let _ = fs::create_dir_all(&fallback);
                return fallback;
            }
            path
        }
        None => {
            warn!("could not determine home directory, falling back to local .shroud");
            let fallback = PathBuf::from(".shroud");
            let _ = fs::create_dir_all(&fallback);
            fallback
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Sleep between empty mailbox polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-connection timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Default rendezvous address when none is given on the command line.
    #[serde(default = "default_rendezvous")]
    pub rendezvous: String,
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_rendezvous() -> String {
    "127.0.0.1:9530".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rendezvous: default_rendezvous(),
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        let mut path = shroud_data_dir();
        path.push("config.toml");
        path
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            let config = Config::default();
            config.save()?;
            return Ok(config);
        }
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
