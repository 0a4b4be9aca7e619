//! Runtime configuration, loaded from a JSON file
//!
//! Every field has a default so a config file only needs to name what it changes.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context};
use common::lock::LOCK_DIR;
use networking::{REQUEST_ADDR, REQUEST_TIMEOUT, SUBSCRIBE_ADDR};
use serde::{Deserialize, Serialize};
use tracing::{info, Level};

/// Environment variable pointing at a settings file
pub const CONFIG_ENV: &str = "PT_SDK_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device_manager: DeviceManagerSettings,
    pub plate: PlateSettings,
    pub miniscreen: MiniscreenSettings,
    pub lock_dir: PathBuf,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceManagerSettings {
    pub request_addr: SocketAddr,
    pub subscribe_addr: SocketAddr,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateSettings {
    pub bus: u8,
    pub address: u8,
    pub heartbeat: bool,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniscreenSettings {
    /// Zero disables frame rate limiting
    pub max_fps: f64,
    /// 0 for upright, 2 for upside down
    pub rotation: u8,
    /// Fail instead of waiting when another process owns the display
    pub exclusive: bool,
    pub lock_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_manager: DeviceManagerSettings::default(),
            plate: PlateSettings::default(),
            miniscreen: MiniscreenSettings::default(),
            lock_dir: PathBuf::from(LOCK_DIR),
            log_level: "debug".to_owned(),
        }
    }
}

impl Default for DeviceManagerSettings {
    fn default() -> Self {
        Self {
            request_addr: REQUEST_ADDR,
            subscribe_addr: SUBSCRIBE_ADDR,
            timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self {
            bus: 1,
            address: 0x04,
            heartbeat: true,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl Default for MiniscreenSettings {
    fn default() -> Self {
        Self {
            max_fps: 16.67,
            rotation: 0,
            exclusive: true,
            lock_path: PathBuf::from("/tmp/pt-oled.lock"),
        }
    }
}

impl Settings {
    #[tracing::instrument]
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Read settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw).context("Parse settings")?;
        settings.validate()?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Loads the file named by `PT_SDK_CONFIG`, falling back to the defaults
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.miniscreen.rotation, 0 | 2) {
            bail!(
                "Miniscreen rotation must be 0 or 2, got {}",
                self.miniscreen.rotation
            );
        }
        if self.miniscreen.max_fps < 0.0 {
            bail!("Miniscreen max fps can't be negative");
        }
        if self.plate.address > 0x7F {
            bail!("Plate address {:#x} is not a 7 bit address", self.plate.address);
        }
        self.log_level()?;

        Ok(())
    }

    pub fn log_level(&self) -> anyhow::Result<Level> {
        Level::from_str(&self.log_level)
            .map_err(|_| anyhow::anyhow!("Unknown log level {:?}", self.log_level))
    }
}

impl DeviceManagerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PlateSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
