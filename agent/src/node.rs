//! Node state.
//!
//! One [`Node`] per daemon process: the runtime handle, GPU inventory,
//! exit store, follower registry and tunnel registry. The node itself
//! persists nothing — on restart the managed-label scan rebuilds the
//! whole picture from the runtime.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use corral_core::auth::{self, BookkeepInfo};
use corral_core::config::Config;
use corral_core::error::CorralError;

use crate::exit_store::ExitStore;
use crate::followers::FollowerRegistry;
use crate::inventory;
use crate::runtime::{ContainerRuntime, ContainerSummary, RuntimeError, MANAGED_LABEL};
use crate::tunnel::TunnelRegistry;

/// Internal stand-in for "no timeout".
pub const TIMEOUT_SENTINEL: u64 = 2_147_483_647;

/// A runtime container whose label verified: the daemon manages it.
#[derive(Debug, Clone)]
pub struct Managed {
    pub summary: ContainerSummary,
    pub info: BookkeepInfo,
    /// Force-killed but possibly still visible in the runtime.
    pub removed: bool,
}

impl Managed {
    pub fn status_str(&self) -> &'static str {
        if self.removed {
            "removed"
        } else {
            self.summary.status.as_str()
        }
    }
}

/// What a container reference resolved to.
#[derive(Debug)]
pub enum Target {
    Live(Managed),
    Finalized(String),
}

pub struct Node {
    pub cfg: Config,
    pub hostname: String,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub gpu_count: usize,
    pub shared_devices: Vec<String>,
    pub exit_store: Mutex<ExitStore>,
    pub mark_removed: Mutex<HashSet<String>>,
    pub followers: FollowerRegistry,
    pub tunnels: TunnelRegistry,
}

impl Node {
    pub fn new(cfg: Config, hostname: String, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let gpu_count = inventory::detect_gpu_count(cfg.gpu_count);
        Self {
            cfg,
            hostname,
            runtime,
            gpu_count,
            shared_devices: inventory::shared_devices(),
            exit_store: Mutex::new(ExitStore::new()),
            mark_removed: Mutex::new(HashSet::new()),
            followers: FollowerRegistry::new(),
            tunnels: TunnelRegistry::new(),
        }
    }

    /// Enumerate managed containers: runtime containers whose
    /// `corral.managed` label verifies under the shared key. This is
    /// the only trust boundary between the daemon and whatever runtime
    /// state it inherits.
    pub async fn scan(&self) -> Result<Vec<Managed>, RuntimeError> {
        let all = self.runtime.list().await?;
        let marked = self.mark_removed.lock().expect("mark set poisoned").clone();
        let mut managed = Vec::new();
        for summary in all {
            let Some(token) = summary.labels.get(MANAGED_LABEL) else {
                continue;
            };
            match auth::verify_label(token, &self.cfg.jwt_key) {
                Ok(info) => {
                    let removed = marked.contains(&summary.short_id);
                    managed.push(Managed {
                        summary,
                        info,
                        removed,
                    });
                }
                Err(_) => {
                    warn!(
                        container = %summary.name,
                        "invalid token in managed label, skipping"
                    );
                }
            }
        }
        Ok(managed)
    }

    /// GPUs not held by any managed container, ascending.
    pub fn free_gpu_ids(&self, managed: &[Managed]) -> Vec<u32> {
        let held: HashSet<u32> = managed
            .iter()
            .flat_map(|m| m.info.gpu_ids.iter().copied())
            .collect();
        (0..self.gpu_count as u32)
            .filter(|gpu| !held.contains(gpu))
            .collect()
    }

    /// Resolve a container reference: exact short-id prefix or exact
    /// name, over live managed containers and the exit store. Zero
    /// matches fall back to a direct runtime lookup, which must still
    /// produce a managed container.
    pub async fn resolve(&self, reference: &str) -> Result<Target, CorralError> {
        if reference.is_empty() {
            return Err(CorralError::BadRequest("empty container reference".into()));
        }
        let managed = self.scan().await?;
        let live: Vec<&Managed> = managed
            .iter()
            .filter(|m| {
                m.summary.short_id.starts_with(reference) || m.summary.name == reference
            })
            .collect();
        let finalized: Vec<String> = {
            let store = self.exit_store.lock().expect("exit store poisoned");
            store
                .iter()
                .filter(|(short_id, entry)| {
                    short_id.starts_with(reference) || entry.name == reference
                })
                .map(|(short_id, _)| short_id.clone())
                .collect()
        };

        match live.len() + finalized.len() {
            0 => {}
            1 => {
                return Ok(match live.first() {
                    Some(m) => Target::Live((*m).clone()),
                    None => Target::Finalized(finalized[0].clone()),
                })
            }
            _ => return Err(CorralError::Ambiguous(reference.to_string())),
        }

        // Nothing matched the indexes; ask the runtime directly (full
        // ids land here, as does anything we never managed).
        let summary = self
            .runtime
            .lookup(reference)
            .await
            .map_err(CorralError::from)?;
        let token = summary.labels.get(MANAGED_LABEL).ok_or_else(|| {
            CorralError::Internal(format!("container `{reference}` not managed"))
        })?;
        let info = auth::verify_label(token, &self.cfg.jwt_key).map_err(|_| {
            CorralError::Internal(format!("container `{reference}` has an invalid managed label"))
        })?;
        let removed = self
            .mark_removed
            .lock()
            .expect("mark set poisoned")
            .contains(&summary.short_id);
        Ok(Target::Live(Managed {
            summary,
            info,
            removed,
        }))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    pub fn test_config() -> Config {
        serde_json::from_str(
            r#"{"jwt_key": "test-key", "central_host": "127.0.0.1:23549",
                "mount_paths": ["/data"], "gpu_count": 8}"#,
        )
        .unwrap()
    }

    pub fn test_node(runtime: Arc<MockRuntime>) -> Node {
        Node::new(test_config(), "node-a".into(), runtime)
    }

    pub fn managed_label(gpu_ids: Vec<u32>, user: &str, timeout: u64) -> (String, String) {
        let info = BookkeepInfo {
            gpu_ids,
            user: user.into(),
            timeout,
        };
        (
            MANAGED_LABEL.to_string(),
            auth::sign_label(&info, "test-key").unwrap(),
        )
    }
}
