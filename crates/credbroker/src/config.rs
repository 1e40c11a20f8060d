//! Client configuration
//!
//! A small YAML document naming the broker endpoint and the bearer token.
//! An explicit `--config` path must parse; the conventional locations are
//! tried in order and silently skipped when absent or unreadable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker endpoint, e.g. "127.0.0.1:9876".
    #[serde(default)]
    pub server: String,

    /// Bearer token presented with every exec.
    #[serde(default)]
    pub token: String,
}

impl ClientConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            return serde_yaml::from_str(&data)
                .with_context(|| format!("parsing config {}", path.display()));
        }

        for path in Self::default_paths() {
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_yaml::from_str(&data) {
                Ok(config) => return Ok(config),
                Err(_) => continue,
            }
        }

        // Nothing found; flags will have to fill the gaps.
        Ok(Self::default())
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("credbroker.yaml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".credbroker.yaml"));
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("credbroker").join("client.yaml"));
        }
        paths.push(PathBuf::from("/etc/credbroker/client.yaml"));
        paths
    }
}
