//! Daemon command handlers.
//!
//! The daemon is a callee on the same framed protocol the central
//! serves: each inbound request is handled on its own task and answered
//! on its ticket. Container references resolve by exact short-id prefix
//! or exact name across live managed containers and the exit store.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use corral_core::auth::{self, BookkeepInfo};
use corral_core::error::CorralError;
use corral_core::protocol::{Request, Response};

use crate::exit_store::LOG_SNAPSHOT_LIMIT;
use crate::node::{Managed, Node, Target, TIMEOUT_SENTINEL};
use crate::runtime::RunSpec;

/// Handle one request from the central and answer on its ticket.
pub async fn dispatch_frame(
    node: Arc<Node>,
    outgoing: mpsc::UnboundedSender<String>,
    request: Request,
) {
    let ticket = request.ticket.clone();
    let line = match handle(&node, &outgoing, &request).await {
        Ok(Some(body)) => Response::ok(ticket, body).to_line(),
        Ok(None) => return,
        Err(err) => {
            debug!(cmd = %request.cmd, code = err.code(), "daemon command failed: {err}");
            Response::err(ticket, &err).to_line()
        }
    };
    let _ = outgoing.send(line);
}

async fn handle(
    node: &Arc<Node>,
    outgoing: &mpsc::UnboundedSender<String>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    match request.cmd.as_str() {
        "node_info" => node_info(node, request).await,
        "run_container" => run_container(node, request).await,
        "list_containers" => list_containers(node).await,
        "get_logs" => get_logs(node, request).await,
        "follow_logs" => follow_logs(node, request).await,
        "poll_logs" => poll_logs(node, request).await,
        "stop_container" => stop_container(node, request).await,
        "kill_container" => kill_container(node, request).await,
        "remove_container" => remove_container(node, request).await,
        "tcpconn" => tcpconn(node, outgoing, request).await,
        "tcpsend" => tcpsend(node, request).await,
        "tcpflowpause" => set_flow(node, request, true),
        "tcpflowresume" => set_flow(node, request, false),
        "tcpstop" => tcpstop(node, request).await,
        "tcpfwd2" => tcpfwd2(node, request).await,
        other => Err(CorralError::UnknownCommand(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// inspection
// ---------------------------------------------------------------------------

async fn node_info(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let include_finalized: bool = request.opt_arg("include_finalized")?.unwrap_or(false);

    let managed = node.scan().await?;
    let free_gpu_ids = node.free_gpu_ids(&managed);
    let mut names: Vec<String> = managed.iter().map(|m| m.summary.name.clone()).collect();
    let mut ids: Vec<String> = managed.iter().map(|m| m.summary.short_id.clone()).collect();

    if include_finalized {
        let store = node.exit_store.lock().expect("exit store poisoned");
        for (short_id, entry) in store.iter() {
            names.push(entry.name.clone());
            ids.push(short_id.clone());
        }
    }

    Ok(Some(json!({
        "free_gpu_ids": free_gpu_ids,
        "names": names,
        "ids": ids,
    })))
}

async fn list_containers(node: &Node) -> Result<Option<Value>, CorralError> {
    let managed = node.scan().await?;
    let mut containers = Map::new();
    for m in &managed {
        containers.insert(
            m.summary.short_id.clone(),
            json!({
                "gpu_ids": m.info.gpu_ids,
                "name": m.summary.name,
                "user": m.info.user,
                "status": m.status_str(),
                "node": node.hostname,
            }),
        );
    }
    {
        let store = node.exit_store.lock().expect("exit store poisoned");
        for (short_id, entry) in store.iter() {
            containers.insert(
                short_id.clone(),
                json!({
                    "gpu_ids": [],
                    "name": entry.name,
                    "user": entry.user,
                    "status": "finalized",
                    "node": node.hostname,
                }),
            );
        }
    }
    Ok(Some(json!({ "containers": containers })))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn exec_to_cmd(exec: &Value) -> Result<Vec<String>, CorralError> {
    match exec {
        Value::Array(_) => serde_json::from_value(exec.clone())
            .map_err(|_| CorralError::BadRequest("field `exec` should be a list of strings".into())),
        Value::String(line) => Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            line.clone(),
        ]),
        _ => Err(CorralError::BadRequest(
            "field `exec` should be a string or list of strings".into(),
        )),
    }
}

async fn run_container(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let name: String = request.arg("name")?;
    let image: String = request.arg("image")?;
    let gpu_ids: Vec<u32> = request.arg("gpu_ids")?;
    let user: String = request.arg("user")?;
    let exec = request
        .args
        .get("exec")
        .ok_or_else(|| CorralError::BadRequest("missing field `exec`".into()))?;
    let mut env: Vec<String> = request.opt_arg("env")?.unwrap_or_default();
    let timeout: i64 = request.opt_arg("timeout")?.unwrap_or(0);

    let managed = node.scan().await?;
    let taken_live = managed.iter().any(|m| m.summary.name == name);
    let taken_finalized = {
        let store = node.exit_store.lock().expect("exit store poisoned");
        let found = store.iter().any(|(_, entry)| entry.name == name);
        found
    };
    if taken_live || taken_finalized {
        return Err(CorralError::ContainerExists(name));
    }

    let free = node.free_gpu_ids(&managed);
    if let Some(busy) = gpu_ids.iter().find(|gpu| !free.contains(gpu)) {
        return Err(CorralError::BadRequest(format!("gpu {busy} is not free")));
    }

    let timeout = if timeout <= 0 {
        TIMEOUT_SENTINEL
    } else {
        timeout as u64
    };
    let label_token = auth::sign_label(
        &BookkeepInfo {
            gpu_ids: gpu_ids.clone(),
            user: user.clone(),
            timeout,
        },
        &node.cfg.jwt_key,
    )?;

    // NCCL peer-to-peer misbehaves on partial-node slices.
    if gpu_ids.len() < 8 {
        env.push("NCCL_P2P_DISABLE=1".to_string());
    }

    let spec = RunSpec {
        name: name.clone(),
        image,
        cmd: exec_to_cmd(exec)?,
        env,
        gpu_ids: gpu_ids.clone(),
        label_token,
        binds: node
            .cfg
            .mount_paths
            .iter()
            .map(|path| format!("{path}:{path}"))
            .collect(),
        devices: node.shared_devices.clone(),
        shm_size_bytes: (64 * gpu_ids.len() as i64 + 32) * 1024 * 1024 * 1024,
    };
    let short_id = node.runtime.run(spec).await?;
    info!(%name, %user, %short_id, ?gpu_ids, "container started");
    Ok(Some(json!({ "short_id": short_id })))
}

// ---------------------------------------------------------------------------
// logs
// ---------------------------------------------------------------------------

async fn get_logs(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let container: String = request.arg("container")?;
    let logs = match node.resolve(&container).await? {
        Target::Live(m) => node.runtime.logs(&m.summary.id, LOG_SNAPSHOT_LIMIT).await?,
        Target::Finalized(short_id) => {
            let store = node.exit_store.lock().expect("exit store poisoned");
            store
                .get(&short_id)
                .map(|entry| entry.logs.clone())
                .unwrap_or_default()
        }
    };
    Ok(Some(json!({ "logs": String::from_utf8_lossy(&logs) })))
}

async fn follow_logs(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let container: String = request.arg("container")?;
    let follower = match node.resolve(&container).await? {
        Target::Live(m) => {
            let stream = node.runtime.follow_logs(&m.summary.id).await?;
            node.followers.register(stream)
        }
        Target::Finalized(short_id) => {
            let store = node.exit_store.lock().expect("exit store poisoned");
            let snapshot = store
                .get(&short_id)
                .map(|entry| entry.logs.clone())
                .unwrap_or_default();
            drop(store);
            node.followers.register_static(snapshot)
        }
    };
    Ok(Some(json!({ "follower": follower })))
}

async fn poll_logs(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let follower: String = request.arg("follower")?;
    let (batch, eof) = node.followers.poll(&follower).await?;
    Ok(Some(json!({
        "log": String::from_utf8_lossy(&batch),
        "eof": eof,
    })))
}

// ---------------------------------------------------------------------------
// lifecycle
// ---------------------------------------------------------------------------

async fn stop_container(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let container: String = request.arg("container")?;
    match node.resolve(&container).await? {
        Target::Finalized(_) => Err(CorralError::AlreadyStopped(container)),
        Target::Live(m) => {
            node.stop_managed(&m).await?;
            Ok(Some(json!({})))
        }
    }
}

async fn kill_container(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let container: String = request.arg("container")?;
    match node.resolve(&container).await? {
        Target::Finalized(_) => Err(CorralError::AlreadyStopped(container)),
        Target::Live(m) => {
            node.kill_managed(&m).await?;
            Ok(Some(json!({})))
        }
    }
}

async fn remove_container(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let container: String = request.arg("container")?;

    // Remove acts on finalized entries only; anything else refuses.
    let managed = node.scan().await?;
    let live_matches = managed
        .iter()
        .filter(|m| m.summary.short_id.starts_with(&container) || m.summary.name == container)
        .count();
    let finalized: Vec<String> = {
        let store = node.exit_store.lock().expect("exit store poisoned");
        store
            .iter()
            .filter(|(short_id, entry)| {
                short_id.starts_with(&container) || entry.name == container
            })
            .map(|(short_id, _)| short_id.clone())
            .collect()
    };

    if live_matches + finalized.len() > 1 {
        return Err(CorralError::Ambiguous(container));
    }
    match finalized.first() {
        Some(short_id) => {
            node.exit_store
                .lock()
                .expect("exit store poisoned")
                .remove(short_id);
            info!(%short_id, "finalized entry removed");
            Ok(Some(json!({})))
        }
        None => Err(CorralError::NotFinalized(container)),
    }
}

impl Node {
    /// Plain stop of a managed container.
    pub async fn stop_managed(&self, m: &Managed) -> Result<(), CorralError> {
        self.runtime.stop(&m.summary.id).await?;
        info!(name = %m.summary.name, "container stopped");
        Ok(())
    }

    /// Force path: SIGKILL every in-container process, then force-remove
    /// the container and remember its short id as removed.
    pub async fn kill_managed(&self, m: &Managed) -> Result<(), CorralError> {
        let mut errors: Vec<String> = Vec::new();

        match self.runtime.top_pids(&m.summary.id).await {
            Ok(pids) => {
                for pid in pids {
                    if let Err(err) = kill_pid(pid) {
                        errors.push(err);
                    }
                }
            }
            Err(err) => errors.push(err.to_string()),
        }

        if let Err(err) = self.runtime.remove(&m.summary.id, true).await {
            errors.push(err.to_string());
        }
        self.mark_removed
            .lock()
            .expect("mark set poisoned")
            .insert(m.summary.short_id.clone());
        info!(name = %m.summary.name, "container killed");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CorralError::Internal(errors.join("\n")))
        }
    }
}

#[cfg(unix)]
fn kill_pid(pid: i32) -> Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Already gone is fine.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(format!("kill {pid}: {err}")),
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: i32) -> Result<(), String> {
    Err("process kill is unsupported on this platform".into())
}

// ---------------------------------------------------------------------------
// tunnels
// ---------------------------------------------------------------------------

async fn tcpconn(
    node: &Node,
    outgoing: &mpsc::UnboundedSender<String>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    let client: String = request.arg("client")?;
    let port: u16 = request.arg("port")?;
    node.tunnels.open(client, port, outgoing.clone()).await?;
    Ok(Some(json!({})))
}

async fn tcpsend(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let client: String = request.arg("client")?;
    let p: u64 = request.arg("p")?;
    let encoded: String = request.arg("d")?;
    let data = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CorralError::BadRequest("field `d` is not valid base64".into()))?
    };
    if let Err(err) = node.tunnels.apply_send(&client, &data, p).await {
        warn!(%client, "tcpsend failed: {err}");
    }
    // Tunnel data frames carry the client's ticket; answering would
    // collide with the client-side correlation, so nothing is sent.
    Ok(None)
}

fn set_flow(node: &Node, request: &Request, paused: bool) -> Result<Option<Value>, CorralError> {
    let client: String = request.arg("client")?;
    node.tunnels.set_paused(&client, paused)?;
    Ok(Some(json!({})))
}

async fn tcpstop(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let client: String = request.arg("client")?;
    let p: u64 = request.arg("p")?;
    node.tunnels.stop(&client, p).await?;
    Ok(Some(json!({})))
}

async fn tcpfwd2(node: &Node, request: &Request) -> Result<Option<Value>, CorralError> {
    let session: String = request.arg("session")?;
    let port: u16 = request.arg("port")?;
    crate::tunnel::open_v2(&node.cfg.central_host, &session, port).await?;
    Ok(Some(json!({})))
}
