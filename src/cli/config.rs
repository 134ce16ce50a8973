//! Configuration discovery and loading.
//!
//! Discovery hierarchy:
//! 1. Current directory: `./prensa-gateway.toml`
//! 2. User config: `~/.prensa-gateway/config.toml`
//! 3. Built-in defaults
//!
//! The upstream API key can always be supplied through the
//! `PRENSA_GATEWAY_API_KEY` environment variable, which takes precedence
//! over any file value.

use crate::gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const API_KEY_ENV: &str = "PRENSA_GATEWAY_API_KEY";
const LOCAL_CONFIG: &str = "prensa-gateway.toml";
const USER_CONFIG_DIR: &str = ".prensa-gateway";
const USER_CONFIG_FILE: &str = "config.toml";

/// On-disk configuration: the gateway settings plus CLI-only extras.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Where the JSON file store keeps usage logs and quota records.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Walks the discovery hierarchy and returns the first configuration
    /// found, falling back to built-in defaults.
    pub fn discover() -> anyhow::Result<FileConfig> {
        for path in Self::candidate_paths() {
            if path.is_file() {
                info!(path = %path.display(), "loading configuration");
                return Self::load(&path);
            }
            debug!(path = %path.display(), "no configuration file here");
        }

        info!("no configuration file found, using built-in defaults");
        Ok(Self::apply_env(FileConfig::default()))
    }

    pub fn load(path: &Path) -> anyhow::Result<FileConfig> {
        let raw = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&raw)?;
        Ok(Self::apply_env(config))
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(home) = env::var_os("HOME") {
            paths.push(
                PathBuf::from(home)
                    .join(USER_CONFIG_DIR)
                    .join(USER_CONFIG_FILE),
            );
        }
        paths
    }

    fn apply_env(mut config: FileConfig) -> FileConfig {
        if let Ok(key) = env::var(API_KEY_ENV)
            && !key.is_empty()
        {
            config.gateway.upstream.api_key = Some(key);
        }
        config
    }
}
