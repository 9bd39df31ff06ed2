use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub call: CallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Fixed delay before reconnecting a dropped relay link
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Optional TURN fallback for restrictive NATs
    #[serde(default)]
    pub turn: Option<TurnServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long a pending exchange may block the next offer before the cycle
    /// is abandoned and re-armed
    #[serde(default = "default_stable_wait_ms")]
    pub stable_wait_ms: u64,
    /// ICE restarts attempted before a peer session is torn down and rebuilt
    #[serde(default = "default_max_ice_restarts")]
    pub max_ice_restarts: u32,
    #[serde(default = "default_max_chat_len")]
    pub max_chat_len: usize,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
}

fn default_reconnect_delay_ms() -> u64 {
    800
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_stable_wait_ms() -> u64 {
    2500
}

fn default_max_ice_restarts() -> u32 {
    2
}

fn default_max_chat_len() -> usize {
    500
}

fn default_max_name_len() -> usize {
    64
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            turn: None,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stable_wait_ms: default_stable_wait_ms(),
            max_ice_restarts: default_max_ice_restarts(),
            max_chat_len: default_max_chat_len(),
            max_name_len: default_max_name_len(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            call: CallConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content =
                fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.signaling.reconnect_delay_ms)
    }

    pub fn stable_wait(&self) -> Duration {
        Duration::from_millis(self.call.stable_wait_ms)
    }
}

/// Get the callmesh directory (~/.callmesh)
pub fn get_callmesh_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".callmesh")
}

/// Get the config file path (~/.callmesh/config.toml)
pub fn get_config_path() -> PathBuf {
    get_callmesh_dir().join("config.toml")
}
