//! Cluster config loading.
//!
//! The central and the daemons share one `config.json`, searched in the
//! working directory, then `~/.corrald/`, then `/etc/corrald/`. The
//! client keeps its own much smaller config under `~/.corral/`, owned
//! by the CLI crate.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "no config found; place config.json in the working directory, \
         ~/.corrald/config.json or /etc/corrald/config.json"
    )]
    NotFound,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Shared symmetric signing key for all tokens.
    pub jwt_key: String,

    /// `host:port` of the central, dialed by daemons and used as the
    /// dial-back target for v2 tunnel side-channels.
    pub central_host: String,

    /// Host paths bind-mounted into every managed container.
    #[serde(default)]
    pub mount_paths: Vec<String>,

    /// Overrides GPU auto-detection on the node.
    #[serde(default)]
    pub gpu_count: Option<usize>,

    // Telemetry endpoint credentials; parsed for the reporter, which
    // ships separately.
    #[serde(default)]
    pub grafana_endpoint: Option<String>,
    #[serde(default)]
    pub grafana_userid: Option<String>,
    #[serde(default)]
    pub grafana_key: Option<String>,

    #[serde(default)]
    pub policy_pod_time_limit: Option<u64>,
    #[serde(default)]
    pub policy_pod_gpu_limit: Option<usize>,
}

impl Config {
    /// Load from the standard search path.
    pub fn load() -> Result<Self, ConfigError> {
        for candidate in search_paths() {
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }
        Err(ConfigError::NotFound)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.json")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".corrald").join("config.json"));
    }
    paths.push(PathBuf::from("/etc/corrald/config.json"));
    paths
}
