//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::calling::ice::IceServerConfig;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub call: CallConfig,
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            call: CallConfig::default(),
            ice_servers: vec![IceServerConfig::default()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay server binds to
    pub listen_addr: String,
    /// WebSocket URL clients connect to
    pub url: String,
    /// Client keep-alive ping interval
    pub heartbeat_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            url: "ws://127.0.0.1:8787".to_string(),
            heartbeat_secs: 30,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Give up if the call is not connected this long after joining the room
    pub connection_timeout_secs: u64,
    /// Pause after teardown so the "ended" status can be shown
    pub end_grace_ms: u64,
    /// How long an invitation rings before it expires
    pub invitation_timeout_secs: u64,
    /// Upper bound on the best-effort call-ended notification
    pub hangup_notify_timeout_ms: u64,
    /// Join the room even when neither camera nor microphone is available
    pub allow_media_less: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            end_grace_ms: 1500,
            invitation_timeout_secs: 45,
            hangup_notify_timeout_ms: 1000,
            allow_media_less: false,
        }
    }
}

impl CallConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn end_grace(&self) -> Duration {
        Duration::from_millis(self.end_grace_ms)
    }

    pub fn invitation_timeout(&self) -> Duration {
        Duration::from_secs(self.invitation_timeout_secs)
    }

    pub fn hangup_notify_timeout(&self) -> Duration {
        Duration::from_millis(self.hangup_notify_timeout_ms)
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("com", "tutor-call", "tutor-call").context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate().context("Invalid [[ice_servers]] entry")?;
        }
        url::Url::parse(&self.relay.url).context("Invalid relay url")?;
        Ok(())
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<PathBuf> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        Ok(path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
