use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// On-disk configuration, TOML. Every field has a default, so a missing file
/// is a valid (permissive) configuration; command-line flags win over file
/// values.
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: ListenConfig,
    pub bridge: BridgeSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub addr: IpAddr,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9090,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSettings {
    /// Origin hosts allowed to open channels; absent means any origin.
    pub allowed_origins: Option<Vec<String>>,
    /// Refuse targets on the bridge machine and its private networks.
    pub deny_local_targets: bool,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            allowed_origins: None,
            deny_local_targets: true,
            connect_timeout_secs: wsbridge::bridge::CONNECT_TIMEOUT.as_secs(),
            ping_interval_secs: wsbridge::bridge::PING_INTERVAL.as_secs(),
        }
    }
}

const USER_PATH: &str = "wsbridge/config.toml";

impl Config {
    /// Load from an explicit path, or from the user config dir. An explicit
    /// path must exist and parse; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => match Self::user_path() {
                Some(path) if path.exists() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn user_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join(USER_PATH))
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[cfg(not(target_os = "windows"))]
fn config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .and_then(dirs_sys::is_absolute_path)
        .or_else(|| dirs_sys::home_dir().map(|home| home.join(".config")))
}

#[cfg(target_os = "windows")]
fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}
