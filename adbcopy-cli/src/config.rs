//! CLI Configuration
//!
//! Loaded from `<config dir>/adbcopy/config.toml`. A default file is written
//! the first time the tool runs so users have something to edit.

use adbcopy_core::QueueConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name inside the configuration directory
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bridge executable and device polling
    #[serde(default)]
    pub adb: AdbConfig,

    /// Transfer queue tunables
    #[serde(default)]
    pub transfer: QueueConfig,

    /// Storage paths
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdbConfig {
    /// `adb` executable, looked up on `PATH` when not absolute
    #[serde(default = "default_adb_path")]
    pub path: PathBuf,

    /// Seconds between two device list polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// Storage paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding `config.toml`
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Destination of `pull` when no local path is given
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_adb_path() -> PathBuf {
    PathBuf::from("adb")
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("adbcopy")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            download_dir: default_download_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb: AdbConfig::default(),
            transfer: QueueConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Config {
    /// Location used when `--config` is not given
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE)
    }

    /// Load the default configuration file, creating it when missing
    pub fn load() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load an explicit configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .transfer
            .validate()
            .context("Invalid [transfer] section")?;
        Ok(config)
    }

    /// Save to `config.toml` inside the configured directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_dir.join(CONFIG_FILE))
    }

    /// Save to an explicit path, creating its directory
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.adb.poll_interval_secs.max(1))
    }
}
