//! Client-side persisted state under `~/.corral/`.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host:port` of the central.
    pub addr: String,
    /// The user's signed token.
    pub token: String,
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".corral")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn history_path() -> PathBuf {
    config_dir().join("history")
}

pub fn load() -> anyhow::Result<ClientConfig> {
    let path = config_path();
    let raw = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no client config at {}; create it as {{\"addr\": \"host:port\", \"token\": \"...\"}}",
            path.display()
        )
    })?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips() {
        let cfg = ClientConfig {
            addr: "127.0.0.1:23549".into(),
            token: "tok".into(),
        };
        let raw = serde_json::to_string(&cfg).unwrap();
        let back: ClientConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.addr, cfg.addr);
        assert_eq!(back.token, cfg.token);
    }
}
