//! Configuration for windlass-manager.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ManagerError, ManagerResult};

/// Top-level configuration for the deployment manager.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ManagerConfig {
    /// Domain the manager operates in.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Persisted target store configuration.
    #[serde(default)]
    pub targets: TargetStoreConfig,

    /// Machine configurator configuration.
    #[serde(default)]
    pub configurator: ConfiguratorConfig,

    /// Random port allocation configuration.
    #[serde(default)]
    pub ports: PortRangeConfig,
}

fn default_domain() -> String {
    "default".to_owned()
}

impl ManagerConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources
    /// override earlier):
    /// 1. Default values
    /// 2. `windlass.toml` in the current directory (if present)
    /// 3. Environment variables with `WINDLASS_` prefix
    pub fn load() -> ManagerResult<Self> {
        Figment::new()
            .merge(Toml::file("windlass.toml"))
            .merge(Env::prefixed("WINDLASS_").split("__"))
            .extract()
            .map_err(|e| ManagerError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ManagerResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WINDLASS_").split("__"))
            .extract()
            .map_err(|e| ManagerError::Config(e.to_string()))
    }
}

/// Persisted target store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetStoreConfig {
    /// Directory holding one record directory per target id.
    #[serde(default = "default_targets_dir")]
    pub directory: PathBuf,
}

fn default_targets_dir() -> PathBuf {
    PathBuf::from("/var/lib/windlass/targets")
}

impl Default for TargetStoreConfig {
    fn default() -> Self {
        Self {
            directory: default_targets_dir(),
        }
    }
}

/// Machine configurator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfiguratorConfig {
    /// How often the polling worker checks candidates (seconds).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Directory holding per-target local configuration scripts
    /// (`<script_dir>/<target-id>/configure.sh`).
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,
}

const fn default_poll_interval_secs() -> u64 {
    2
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("/etc/windlass/scripts")
}

impl Default for ConfiguratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            script_dir: default_script_dir(),
        }
    }
}

/// Random port allocation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PortRangeConfig {
    /// Lowest port considered for allocation.
    #[serde(default = "default_port_min")]
    pub min: u16,

    /// Highest port considered for allocation.
    #[serde(default = "default_port_max")]
    pub max: u16,

    /// Administrator-configured ports never to hand out.
    #[serde(default)]
    pub forbidden: Vec<u16>,
}

const fn default_port_min() -> u16 {
    10_000
}

const fn default_port_max() -> u16 {
    65_500
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
            forbidden: Vec::new(),
        }
    }
}
