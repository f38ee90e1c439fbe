//! Process configuration
//!
//! Looked up in order: the file named by `DAUDIO_CONFIG`, `./daudio.toml`,
//! then `daudio/config.toml` in the platform config directory. The first file
//! found wins; without one every value takes its default.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};

pub const CONFIG_ENV: &str = "DAUDIO_CONFIG";
const LOCAL_CONFIG: &str = "daudio.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub transport: TransportConfig,
    pub watchdog: WatchdogConfig,
    pub log: LogConfig,
}

/// Timeouts and buffer sizing for IO devices and orchestrators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub rpc_timeout_ms: u64,
    pub channel_timeout_ms: u64,
    pub queue_max_size: usize,
    pub queue_ext_size: usize,
    pub speaker_queue_size: usize,
    pub speaker_pre_roll: usize,
    pub ring_buffer_frames: usize,
    pub poll_interval_ms: u64,
    pub flush_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: constants::RPC_WAIT_TIMEOUT.as_millis() as u64,
            channel_timeout_ms: constants::CHANNEL_WAIT_TIMEOUT.as_millis() as u64,
            queue_max_size: constants::DATA_QUEUE_MAX_SIZE,
            queue_ext_size: constants::DATA_QUEUE_EXT_SIZE,
            speaker_queue_size: constants::SPEAKER_QUEUE_MAX_SIZE,
            speaker_pre_roll: constants::SPEAKER_PRE_ROLL,
            ring_buffer_frames: constants::RING_BUFFER_FRAMES,
            poll_interval_ms: constants::QUEUE_POLL_INTERVAL.as_millis() as u64,
            flush_timeout_ms: constants::FLUSH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl DeviceConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Low watermark used before a mic stream starts
    pub fn queue_half_size(&self) -> usize {
        (self.queue_max_size >> 1).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Id this device announces to peers
    pub local_dev_id: String,
    pub listen: SocketAddr,
    /// Peer device id to address
    pub peers: HashMap<String, SocketAddr>,
    /// Frames queued per channel before audio is dropped
    pub write_queue_frames: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_dev_id: "local".into(),
            listen: SocketAddr::from(([0, 0, 0, 0], constants::DEFAULT_ENGINE_PORT)),
            peers: HashMap::new(),
            write_queue_frames: constants::ENGINE_WRITE_QUEUE_FRAMES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: constants::WATCHDOG_INTERVAL.as_millis() as u64,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl AppConfig {
    /// Load from the first config file found, or defaults
    pub fn load() -> Result<Self> {
        match discover_config_file() {
            Some(path) => {
                tracing::info!("Loading config from {}", path.display());
                Self::load_from(&path)
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }
}

fn discover_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!("{} points at missing file {}", CONFIG_ENV, path.display());
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return Some(local);
    }

    directories::ProjectDirs::from("", "", "daudio")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .filter(|path| path.exists())
}
