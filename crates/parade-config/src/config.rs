//! Configuration structs with defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";
const APP_DIR: &str = "military-parade";

/// Top-level peer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub debug: DebugConfig,
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Service namespace. Peers only see others in the same namespace.
    pub service_type: String,
    /// Name announced to other peers. Falls back to the host name.
    pub display_name: Option<String>,
    /// Seconds an invitation may stay unanswered.
    pub invite_timeout_secs: u64,
    /// Longest outgoing chat line, in characters.
    pub max_chat_length: usize,
    /// Accept every invitation. When `false`, only `allowed_peers` may join.
    pub auto_accept_invites: bool,
    pub allowed_peers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_type: "military-parade".to_string(),
            display_name: None,
            invite_timeout_secs: 10,
            max_chat_length: 500,
            auto_accept_invites: true,
            allowed_peers: Vec::new(),
        }
    }
}

/// TCP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on while hosting.
    pub listen_addr: SocketAddr,
    /// Hosts to dial while browsing.
    pub seeds: Vec<SocketAddr>,
    /// Largest accepted frame, in bytes.
    pub max_payload_size: u32,
    /// Seconds a new connection may take to finish its handshake.
    pub handshake_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7878)),
            seeds: Vec::new(),
            max_payload_size: 1_048_576,
            handshake_timeout_secs: 5,
        }
    }
}

/// Debug/development settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter (e.g. "debug", "info,parade_net=trace").
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for parade peers, e.g.
    /// `~/.config/military-parade` on Linux.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join(APP_DIR))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn read(config_path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Load `config.ron` from `config_dir`, writing a default one if absent.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Write `config.ron` into `config_dir`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: config_dir.join(CONFIG_FILE),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_err)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(write_err)?;
        Ok(())
    }

    /// Re-read the file. `Some` only if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;
        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
