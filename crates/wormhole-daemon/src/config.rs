//! Daemon configuration: TOML file with environment overrides.
//!
//! File lives at the conventional user-config path
//! (`~/.config/wormhole/config.toml`); environment variables win over the
//! file, the file over built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::ring::DEFAULT_RING_CAPACITY;

pub const DEFAULT_PORT: u16 = 7117;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub buffer_size: usize,
    pub discovery_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    daemon: DaemonSection,
    #[serde(default)]
    discovery: DiscoverySection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DaemonSection {
    port: u16,
    buffer_size: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_RING_CAPACITY,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DiscoverySection {
    enabled: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

pub fn config_file_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("wormhole").join("config.toml"))
}

fn truthy(raw: &str) -> bool {
    matches!(raw, "true" | "1" | "yes")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config_file_path().as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let file: FileConfig = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            _ => FileConfig::default(),
        };

        let mut config = Config {
            port: file.daemon.port,
            buffer_size: file.daemon.buffer_size,
            discovery_enabled: file.discovery.enabled,
        };

        if let Ok(raw) = std::env::var("WORMHOLE_PORT") {
            config.port = raw.parse().context("invalid WORMHOLE_PORT")?;
        }
        if let Ok(raw) = std::env::var("WORMHOLE_BUFFER_SIZE") {
            config.buffer_size = raw.parse().context("invalid WORMHOLE_BUFFER_SIZE")?;
        }
        if let Ok(raw) = std::env::var("WORMHOLE_DISCOVERY_ENABLED") {
            config.discovery_enabled = truthy(&raw);
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_RING_CAPACITY,
            discovery_enabled: true,
        }
    }
}
