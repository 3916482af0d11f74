//! Courier configuration loader.
//!
//! In production the connection descriptors come out of the platform's
//! database; this binary reads the same shape from a TOML file.

use anyhow::Context;
use courier_channels::ConnectionDescriptor;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "courier.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
}

impl CourierConfig {
    pub fn enabled_connections(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.connections.iter().filter(|entry| entry.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8077".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub descriptor: ConnectionDescriptor,
}

fn default_enabled() -> bool {
    true
}

pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load(path: &Path) -> anyhow::Result<CourierConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}
