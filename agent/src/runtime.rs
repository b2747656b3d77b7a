//! Container runtime adapter.
//!
//! The daemon talks to its runtime through [`ContainerRuntime`] so the
//! bookkeeping and command logic can be exercised against a mock. The
//! one concrete backend is [`DockerRuntime`] over the local Docker
//! socket via `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

use corral_core::error::CorralError;

/// Label key carrying the signed bookkeeping token on managed
/// containers.
pub const MANAGED_LABEL: &str = "corral.managed";

/// Memlock ulimit applied to every managed container.
pub const MEMLOCK_BYTES: i64 = 1_048_576_000;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container name conflict: {0}")]
    Conflict(String),

    #[error("runtime error: {0}")]
    Api(String),
}

impl From<RuntimeError> for CorralError {
    fn from(err: RuntimeError) -> Self {
        // Runtime failures surface as code -1, matching the unhandled
        // path of the error taxonomy.
        CorralError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Dead,
    Other,
}

impl ContainerStatus {
    pub fn from_state(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Running,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Other => "unknown",
        }
    }
}

/// A runtime container as the daemon sees it.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Full runtime id.
    pub id: String,
    /// First 12 hex chars of the id, the stable identifier clients use.
    pub short_id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

/// Everything needed to start one managed container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub gpu_ids: Vec<u32>,
    /// The signed bookkeeping token, stored under [`MANAGED_LABEL`].
    pub label_token: String,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    /// `host:container` device passthroughs.
    pub devices: Vec<String>,
    pub shm_size_bytes: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container on the node, running or not.
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Look one container up by exact id or name.
    async fn lookup(&self, reference: &str) -> Result<ContainerSummary, RuntimeError>;

    /// Create and start a container; returns its short id.
    async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError>;

    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// The last `limit` bytes of the container's log.
    async fn logs(&self, id: &str, limit: usize) -> Result<Vec<u8>, RuntimeError>;

    /// Stream log bytes, following new output until the container
    /// stops. The stream ends on EOF or any runtime error.
    async fn follow_logs(&self, id: &str)
        -> Result<BoxStream<'static, Vec<u8>>, RuntimeError>;

    /// PIDs of every process inside the container, as seen on the host.
    async fn top_pids(&self, id: &str) -> Result<Vec<i32>, RuntimeError>;

    /// Prune stopped containers, dangling networks and unused images.
    async fn prune(&self) -> Result<(), RuntimeError>;
}

/// Keep the last `limit` bytes of a log buffer.
pub fn tail_bytes(mut logs: Vec<u8>, limit: usize) -> Vec<u8> {
    if logs.len() > limit {
        logs.drain(..logs.len() - limit);
    }
    logs
}

// ---------------------------------------------------------------------------
// Docker backend
// ---------------------------------------------------------------------------

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::models::{DeviceMapping, DeviceRequest, HostConfig, ResourcesUlimits};
use bollard::network::PruneNetworksOptions;

pub struct DockerRuntime {
    client: bollard::Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self, RuntimeError> {
        let client = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Api(format!("failed to connect to Docker: {e}")))?;
        Ok(Self { client })
    }
}

fn map_bollard(err: bollard::errors::Error, reference: &str) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(reference.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

fn summary_from_list(raw: bollard::models::ContainerSummary) -> Option<ContainerSummary> {
    let id = raw.id?;
    let name = raw
        .names
        .unwrap_or_default()
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let status = raw
        .state
        .as_deref()
        .map(ContainerStatus::from_state)
        .unwrap_or(ContainerStatus::Other);
    let created_at = raw.created.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
    Some(ContainerSummary {
        short_id: short_id(&id),
        id,
        name,
        status,
        created_at,
        labels: raw.labels.unwrap_or_default(),
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let raw = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        Ok(raw.into_iter().filter_map(summary_from_list).collect())
    }

    async fn lookup(&self, reference: &str) -> Result<ContainerSummary, RuntimeError> {
        let inspect = self
            .client
            .inspect_container(reference, None)
            .await
            .map_err(|e| map_bollard(e, reference))?;
        let id = inspect
            .id
            .ok_or_else(|| RuntimeError::Api("inspect returned no id".into()))?;
        let name = inspect
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| ContainerStatus::from_state(&s.to_string()))
            .unwrap_or(ContainerStatus::Other);
        let created_at = inspect
            .created
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let labels = inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();
        Ok(ContainerSummary {
            short_id: short_id(&id),
            id,
            name,
            status,
            created_at,
            labels,
        })
    }

    async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError> {
        // Make sure the image is available before creating the
        // container.
        let pull_opts = CreateImageOptions {
            from_image: spec.image.as_str(),
            ..Default::default()
        };
        let mut pull_stream = self.client.create_image(Some(pull_opts), None, None);
        while let Some(progress) = pull_stream.next().await {
            match progress {
                Ok(info) => debug!(?info, "image pull progress"),
                Err(e) => {
                    return Err(RuntimeError::Api(format!(
                        "failed to pull image `{}`: {e}",
                        spec.image
                    )))
                }
            }
        }

        let device_ids = spec
            .gpu_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let device_requests = if spec.gpu_ids.is_empty() {
            None
        } else {
            Some(vec![DeviceRequest {
                device_ids: Some(vec![device_ids]),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        };
        let devices = spec
            .devices
            .iter()
            .filter_map(|mapping| {
                let (host, container) = mapping.split_once(':')?;
                Some(DeviceMapping {
                    path_on_host: Some(host.to_string()),
                    path_in_container: Some(container.to_string()),
                    cgroup_permissions: Some("rwm".to_string()),
                })
            })
            .collect::<Vec<_>>();

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            network_mode: Some("host".to_string()),
            device_requests,
            devices: if devices.is_empty() {
                None
            } else {
                Some(devices)
            },
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("memlock".to_string()),
                soft: Some(MEMLOCK_BYTES),
                hard: Some(MEMLOCK_BYTES),
            }]),
            shm_size: Some(spec.shm_size_bytes),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            hostname: Some(spec.name.clone()),
            labels: Some(
                [(MANAGED_LABEL.to_string(), spec.label_token.clone())]
                    .into_iter()
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_bollard(e, &spec.name))?;
        debug!(container_id = %created.id, name = %spec.name, "container created");

        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| map_bollard(e, &spec.name))?;
        Ok(short_id(&created.id))
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| map_bollard(e, id))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_bollard(e, id))
    }

    async fn logs(&self, id: &str, limit: usize) -> Result<Vec<u8>, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.client.logs(id, Some(options));
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_bollard(e, id))?;
            collected.extend_from_slice(&chunk.into_bytes());
            // Keep memory bounded while still ending with the tail.
            if collected.len() > limit * 2 {
                collected = tail_bytes(collected, limit);
            }
        }
        Ok(tail_bytes(collected, limit))
    }

    async fn follow_logs(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Vec<u8>>, RuntimeError> {
        // Probe first so a bad reference fails the request instead of
        // producing an empty stream.
        self.lookup(id).await?;

        // Pump through a channel so the returned stream owns nothing of
        // `self`; the task ends with the log stream.
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let client = self.client.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                tail: "all".to_string(),
                ..Default::default()
            };
            let mut stream = client.logs(&id, Some(options));
            while let Some(Ok(chunk)) = stream.next().await {
                if tx.send(chunk.into_bytes().to_vec()).is_err() {
                    break;
                }
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(stream.boxed())
    }

    async fn top_pids(&self, id: &str) -> Result<Vec<i32>, RuntimeError> {
        let top = self
            .client
            .top_processes(id, None::<bollard::container::TopOptions<String>>)
            .await
            .map_err(|e| map_bollard(e, id))?;
        let titles = top.titles.unwrap_or_default();
        let pid_index = titles
            .iter()
            .position(|t| t == "PID")
            .ok_or_else(|| RuntimeError::Api("top output has no PID column".into()))?;
        Ok(top
            .processes
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.get(pid_index))
            .filter_map(|pid| pid.parse().ok())
            .collect())
    }

    async fn prune(&self) -> Result<(), RuntimeError> {
        self.client
            .prune_containers(None::<bollard::container::PruneContainersOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        self.client
            .prune_networks(None::<PruneNetworksOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        let filters: HashMap<String, Vec<String>> =
            [("dangling".to_string(), vec!["false".to_string()])]
                .into_iter()
                .collect();
        self.client
            .prune_images(Some(PruneImagesOptions { filters }))
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory runtime for exercising bookkeeping and command logic.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub summary: ContainerSummary,
        pub logs: Vec<u8>,
        pub pids: Vec<i32>,
    }

    #[derive(Default)]
    pub struct MockState {
        pub containers: Vec<MockContainer>,
        pub stopped: Vec<String>,
        pub removed: Vec<String>,
        pub killed_forcibly: Vec<String>,
        /// Container ids whose stop call fails.
        pub stop_fails: Vec<String>,
        pub pruned: usize,
    }

    #[derive(Default)]
    pub struct MockRuntime {
        pub state: Mutex<MockState>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add(&self, container: MockContainer) {
            self.state
                .lock()
                .unwrap()
                .containers
                .push(container);
        }

        pub fn set_status(&self, short_id: &str, status: ContainerStatus) {
            let mut state = self.state.lock().unwrap();
            for container in &mut state.containers {
                if container.summary.short_id == short_id {
                    container.summary.status = status;
                }
            }
        }
    }

    /// Build a summary with a synthetic 64-char id derived from the
    /// short id.
    pub fn summary(
        short: &str,
        name: &str,
        status: ContainerStatus,
        labels: HashMap<String, String>,
    ) -> ContainerSummary {
        let id = format!("{short:0<64}");
        ContainerSummary {
            short_id: short.to_string(),
            id,
            name: name.to_string(),
            status,
            created_at: Some(Utc::now()),
            labels,
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .containers
                .iter()
                .map(|c| c.summary.clone())
                .collect())
        }

        async fn lookup(&self, reference: &str) -> Result<ContainerSummary, RuntimeError> {
            self.state
                .lock()
                .unwrap()
                .containers
                .iter()
                .find(|c| c.summary.id == reference || c.summary.name == reference)
                .map(|c| c.summary.clone())
                .ok_or_else(|| RuntimeError::NotFound(reference.to_string()))
        }

        async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError> {
            let mut state = self.state.lock().unwrap();
            if state.containers.iter().any(|c| c.summary.name == spec.name) {
                return Err(RuntimeError::Conflict(spec.name));
            }
            let short = format!("{:012x}", state.containers.len() + 1);
            let mut labels = HashMap::new();
            labels.insert(MANAGED_LABEL.to_string(), spec.label_token);
            state.containers.push(MockContainer {
                summary: summary(&short, &spec.name, ContainerStatus::Running, labels),
                logs: Vec::new(),
                pids: Vec::new(),
            });
            Ok(short)
        }

        async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            if state.stop_fails.iter().any(|f| f == id) {
                return Err(RuntimeError::Api(format!("stop of `{id}` failed")));
            }
            state.stopped.push(id.to_string());
            for container in &mut state.containers {
                if container.summary.id == id || container.summary.name == id {
                    container.summary.status = ContainerStatus::Exited;
                }
            }
            Ok(())
        }

        async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            state.removed.push(id.to_string());
            if force {
                state.killed_forcibly.push(id.to_string());
            }
            state
                .containers
                .retain(|c| c.summary.id != id && c.summary.name != id);
            Ok(())
        }

        async fn logs(&self, id: &str, limit: usize) -> Result<Vec<u8>, RuntimeError> {
            let state = self.state.lock().unwrap();
            let container = state
                .containers
                .iter()
                .find(|c| c.summary.id == id || c.summary.name == id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            Ok(tail_bytes(container.logs.clone(), limit))
        }

        async fn follow_logs(
            &self,
            id: &str,
        ) -> Result<BoxStream<'static, Vec<u8>>, RuntimeError> {
            let logs = self.logs(id, usize::MAX).await?;
            Ok(futures_util::stream::iter(vec![logs]).boxed())
        }

        async fn top_pids(&self, id: &str) -> Result<Vec<i32>, RuntimeError> {
            let state = self.state.lock().unwrap();
            state
                .containers
                .iter()
                .find(|c| c.summary.id == id || c.summary.name == id)
                .map(|c| c.pids.clone())
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
        }

        async fn prune(&self) -> Result<(), RuntimeError> {
            self.state.lock().unwrap().pruned += 1;
            Ok(())
        }
    }
}
