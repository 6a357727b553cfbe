//! Runtime configuration
//!
//! `Config` is the serde-backed file format (JSON, every field optional);
//! each service takes its own runtime struct with `Duration`s.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Peripheral-side timing and cache bounds.
#[derive(Clone, Debug)]
pub struct PeripheralConfig {
    /// Name shown to centrals while advertising.
    pub local_name: String,
    /// How long a timed advertising window stays open.
    pub advertising_timeout: Duration,
    /// Delay before the connection-lost timer re-advertises.
    pub connection_lost_retry: Duration,
    /// Number of recent messages kept for reads.
    pub cache_capacity: usize,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            local_name: default_local_name(),
            advertising_timeout: Duration::from_secs(default_advertising_timeout_secs()),
            connection_lost_retry: Duration::from_secs(default_connection_lost_retry_secs()),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CentralConfig {
    /// Pushed values shorter than this are treated as a hint and followed by a read.
    pub complete_notification_len: usize,
    /// Upper bound on chunks fetched for one long read.
    pub max_read_chunks: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            complete_notification_len: default_complete_notification_len(),
            max_read_chunks: default_max_read_chunks(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Multiplier applied to playback; 2.0 halves every delay.
    pub playback_speed: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            playback_speed: default_playback_speed(),
        }
    }
}

impl SimulatorConfig {
    /// Scale a logged delay by the playback speed.
    pub fn scale(&self, delay: Duration) -> Duration {
        delay.div_f64(self.playback_speed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralSettings {
    #[serde(default = "default_local_name")]
    pub local_name: String,
    #[serde(default = "default_advertising_timeout_secs")]
    pub advertising_timeout_secs: u64,
    #[serde(default = "default_connection_lost_retry_secs")]
    pub connection_lost_retry_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        Self {
            local_name: default_local_name(),
            advertising_timeout_secs: default_advertising_timeout_secs(),
            connection_lost_retry_secs: default_connection_lost_retry_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralSettings {
    #[serde(default = "default_complete_notification_len")]
    pub complete_notification_len: usize,
    #[serde(default = "default_max_read_chunks")]
    pub max_read_chunks: usize,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            complete_notification_len: default_complete_notification_len(),
            max_read_chunks: default_max_read_chunks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSettings {
    #[serde(default = "default_playback_speed")]
    pub playback_speed: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            playback_speed: default_playback_speed(),
        }
    }
}

fn default_local_name() -> String {
    "BLEConnect Simulator".to_string()
}
fn default_advertising_timeout_secs() -> u64 {
    120
}
fn default_connection_lost_retry_secs() -> u64 {
    5
}
fn default_cache_capacity() -> usize {
    10
}
fn default_complete_notification_len() -> usize {
    20
}
fn default_max_read_chunks() -> usize {
    64
}
fn default_playback_speed() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub peripheral: PeripheralSettings,
    #[serde(default)]
    pub central: CentralSettings,
    #[serde(default)]
    pub simulator: SimulatorSettings,
    /// File backing the central's known-peer store; in-memory when absent.
    #[serde(default)]
    pub known_peer_store: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config = serde_json::from_slice(&data)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peripheral.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "peripheral.cache_capacity",
                reason: "must hold at least one message".to_string(),
            });
        }
        if self.central.max_read_chunks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "central.max_read_chunks",
                reason: "must allow at least one read".to_string(),
            });
        }
        if !(self.simulator.playback_speed.is_finite() && self.simulator.playback_speed > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "simulator.playback_speed",
                reason: format!("{} is not a positive number", self.simulator.playback_speed),
            });
        }
        Ok(())
    }

    pub fn peripheral(&self) -> PeripheralConfig {
        PeripheralConfig {
            local_name: self.peripheral.local_name.clone(),
            advertising_timeout: Duration::from_secs(self.peripheral.advertising_timeout_secs),
            connection_lost_retry: Duration::from_secs(self.peripheral.connection_lost_retry_secs),
            cache_capacity: self.peripheral.cache_capacity,
        }
    }

    pub fn central(&self) -> CentralConfig {
        CentralConfig {
            complete_notification_len: self.central.complete_notification_len,
            max_read_chunks: self.central.max_read_chunks,
        }
    }

    pub fn simulator(&self) -> SimulatorConfig {
        SimulatorConfig {
            playback_speed: self.simulator.playback_speed,
        }
    }
}
