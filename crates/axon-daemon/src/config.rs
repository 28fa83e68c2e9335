//! Configuration loading

use anyhow::Result;
use axon_discovery::MasterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default, rename = "master")]
    pub masters: Vec<MasterSection>,
    #[serde(default, rename = "family")]
    pub families: Vec<FamilyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for web server
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Values used by every master that doesn't override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Delay between background sweeps in milliseconds (0 to disable)
    #[serde(default = "default_search_cadence")]
    pub search_cadence_ms: u64,
    /// Maximum devices per bus
    #[serde(default = "default_max_slave_count")]
    pub max_slave_count: usize,
    /// Sweeps a device may be missed before removal
    #[serde(default = "default_slave_ttl")]
    pub slave_ttl: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            search_cadence_ms: default_search_cadence(),
            max_slave_count: default_max_slave_count(),
            slave_ttl: default_slave_ttl(),
        }
    }
}

fn default_search_cadence() -> u64 {
    10_000
}

fn default_max_slave_count() -> usize {
    10
}

fn default_slave_ttl() -> u32 {
    10
}

/// One bus master, backed by a simulated bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSection {
    pub name: String,
    #[serde(default)]
    pub search_cadence_ms: Option<u64>,
    #[serde(default)]
    pub max_slave_count: Option<usize>,
    #[serde(default)]
    pub slave_ttl: Option<u32>,
    #[serde(default)]
    pub enable_pullup: bool,
    /// Devices plugged into the simulated bus at startup
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registration number in `ff-dddddddddddd` form
    pub id: String,
    #[serde(default)]
    pub alarm: bool,
}

/// A family code handled by the logging family driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub code: u8,
    pub name: String,
}

impl Config {
    /// Resolve a master section against the defaults
    pub fn master_config(&self, section: &MasterSection) -> MasterConfig {
        MasterConfig {
            name: section.name.clone(),
            max_slave_count: section
                .max_slave_count
                .unwrap_or(self.defaults.max_slave_count),
            slave_ttl: section.slave_ttl.unwrap_or(self.defaults.slave_ttl),
            search_cadence_ms: section
                .search_cadence_ms
                .unwrap_or(self.defaults.search_cadence_ms),
            enable_pullup: section.enable_pullup,
        }
    }

    /// Configured masters, or a single empty one when none are listed
    pub fn master_sections(&self) -> Vec<MasterSection> {
        if !self.masters.is_empty() {
            return self.masters.clone();
        }
        vec![MasterSection {
            name: "w1_bus_master1".to_string(),
            search_cadence_ms: None,
            max_slave_count: None,
            slave_ttl: None,
            enable_pullup: false,
            devices: Vec::new(),
        }]
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
