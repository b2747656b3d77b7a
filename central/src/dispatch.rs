//! Client-facing command handlers.
//!
//! Every inbound request frame is dispatched here on its own task, so a
//! slow broadcast never head-of-line-blocks other commands on the same
//! connection. Handlers return `Ok(Some(body))` for a success response,
//! `Ok(None)` for fire-and-forget commands that emit nothing, or a
//! [`CorralError`] which the wrapper turns into `{code, msg}`.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use corral_core::auth::{self, TokenKind};
use corral_core::error::CorralError;
use corral_core::gate::SequencedGate;
use corral_core::protocol::client::AsyncClient;
use corral_core::protocol::{Request, Response};
use corral_core::sched::schedule;

use crate::aggregate::{any_aggregate, cat_aggregate, Outcome};
use crate::state::{Central, ClientConn, DaemonEntry};
use crate::tunnel::{self, TunnelRoute};

/// Handle one request frame and send the response (if any) back on the
/// originating connection.
pub async fn dispatch_frame(central: Arc<Central>, conn: Arc<ClientConn>, request: Request) {
    let ticket = request.ticket.clone();
    let line = match handle(&central, &conn, &request).await {
        Ok(Some(body)) => Response::ok(ticket, body).to_line(),
        Ok(None) => return,
        Err(err) => {
            debug!(cmd = %request.cmd, code = err.code(), "command failed: {err}");
            Response::err(ticket, &err).to_line()
        }
    };
    let _ = conn.outgoing.send(line);
}

async fn handle(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    match request.cmd.as_str() {
        "auth" => auth_handler(central, conn, request).await,
        "daemon" => daemon_handler(central, conn).await,
        "nodes" => nodes_handler(central, conn).await,
        "ps" => ps_handler(central, conn, request).await,
        "logs" => relay_any(central, conn, request, "get_logs").await,
        "stop" => relay_any(central, conn, request, "stop_container").await,
        "kill" => relay_any(central, conn, request, "kill_container").await,
        "delete" => relay_any(central, conn, request, "remove_container").await,
        "jstop" => job_fanout(central, conn, request, "stop_container", false).await,
        "jdelete" => job_fanout(central, conn, request, "remove_container", true).await,
        "run" => run_handler(central, conn, request).await,
        "follow_logs" => follow_logs_handler(central, conn, request).await,
        "poll_logs" => poll_logs_handler(central, conn, request).await,
        "tcpconn" => tcpconn_handler(central, conn, request).await,
        "tcpsend" => tcpsend_handler(central, conn, request).await,
        "tcpstop" => tcpstop_handler(central, conn, request).await,
        "tcpfwd2" => tcpfwd2_handler(central, conn, request).await,
        other => Err(CorralError::UnknownCommand(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// auth and registration
// ---------------------------------------------------------------------------

async fn auth_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    let token: String = request.arg("token")?;
    let identity = auth::verify(&token, &central.cfg.jwt_key)?;

    let mut state = conn.auth.lock().expect("auth state poisoned");
    state.kind = Some(identity.kind);
    state.name = Some(identity.user.clone());
    info!(user = %identity.user, kind = identity.kind.as_str(), "connection authenticated");
    Ok(Some(json!({ "user": identity.user })))
}

async fn daemon_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
) -> Result<Option<Value>, CorralError> {
    let node = conn.check_auth(TokenKind::Daemon)?;
    let entry = Arc::new(DaemonEntry {
        node: node.clone(),
        conn: conn.clone(),
        client: AsyncClient::new(conn.outgoing.clone()),
    });
    central.register_daemon(entry.clone());
    *conn.daemon.lock().expect("daemon slot poisoned") = Some(entry);
    info!(%node, "daemon registered");
    // Registration holds until the connection closes; there is no
    // response frame for it.
    Ok(None)
}

// ---------------------------------------------------------------------------
// broadcast plumbing
// ---------------------------------------------------------------------------

async fn broadcast(central: &Central, cmd: &str, args: Value) -> Vec<Outcome> {
    let entries = central.daemon_entries();
    join_all(
        entries
            .iter()
            .map(|entry| entry.client.issue(cmd, args.clone())),
    )
    .await
}

/// `node_info` from every daemon, keyed by node name.
async fn collect_nodes(
    central: &Central,
    include_finalized: bool,
) -> Result<BTreeMap<String, Map<String, Value>>, CorralError> {
    let entries = central.daemon_entries();
    debug!(daemons = entries.len(), "collecting node info");
    let results = join_all(entries.iter().map(|entry| async {
        let outcome = entry
            .client
            .issue(
                "node_info",
                json!({ "include_finalized": include_finalized }),
            )
            .await;
        (entry.node.clone(), outcome)
    }))
    .await;

    let mut nodes = BTreeMap::new();
    for (node, outcome) in results {
        nodes.insert(node, outcome?.into_result()?);
    }
    Ok(nodes)
}

fn info_names(info: &Map<String, Value>) -> impl Iterator<Item = &str> {
    info.get("names")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn info_lists_container(info: &Map<String, Value>, container: &str) -> bool {
    let ids = info
        .get("ids")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    info_names(info).chain(ids).any(|name| name == container)
}

/// Locate the daemon whose node owns `container` (by name or id).
async fn owning_daemon(
    central: &Central,
    container: &str,
) -> Result<Arc<DaemonEntry>, CorralError> {
    let nodes = collect_nodes(central, false).await?;
    for (node, info) in &nodes {
        if info_lists_container(info, container) {
            return central.daemon_for_node(node).ok_or(CorralError::Daemon {
                code: -1,
                msg: format!("daemon for node `{node}` disappeared"),
            });
        }
    }
    Err(CorralError::ContainerNotFound(container.to_string()))
}

// ---------------------------------------------------------------------------
// inspection commands
// ---------------------------------------------------------------------------

async fn nodes_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let nodes = collect_nodes(central, false).await?;
    Ok(Some(json!({ "nodes": nodes })))
}

async fn ps_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let filt: Option<String> = request.opt_arg("filt")?;

    let merged = cat_aggregate(broadcast(central, "list_containers", json!({})).await)?;
    let containers = merged
        .get("containers")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let matches = |id: &str, entry: &Value| -> bool {
        let Some(filt) = filt.as_deref() else {
            return true;
        };
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
        let user = entry.get("user").and_then(Value::as_str).unwrap_or("");
        id.contains(filt) || name.contains(filt) || user.contains(filt)
    };
    let filtered: Map<String, Value> = containers
        .into_iter()
        .filter(|(id, entry)| matches(id, entry))
        .collect();
    Ok(Some(json!({ "containers": filtered })))
}

/// logs/stop/kill/delete: broadcast one daemon op and take the first
/// success.
async fn relay_any(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
    daemon_cmd: &str,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let container: String = request.arg("container")?;
    let merged = any_aggregate(
        broadcast(central, daemon_cmd, json!({ "container": container })).await,
    )?;
    Ok(Some(Value::Object(merged)))
}

// ---------------------------------------------------------------------------
// job commands
// ---------------------------------------------------------------------------

fn is_job_member(name: &str, job: &str) -> bool {
    name.strip_prefix(job)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

async fn job_fanout(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
    daemon_cmd: &str,
    include_finalized: bool,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let job: String = request.arg("job")?;

    let nodes = collect_nodes(central, include_finalized).await?;
    let mut tasks = Vec::new();
    for (node, info) in &nodes {
        let Some(entry) = central.daemon_for_node(node) else {
            continue;
        };
        for name in info_names(info) {
            if is_job_member(name, &job) {
                let entry = entry.clone();
                let name = name.to_string();
                let cmd = daemon_cmd.to_string();
                tasks.push(async move {
                    entry.client.issue(&cmd, json!({ "container": name })).await
                });
            }
        }
    }
    if tasks.is_empty() {
        return Err(CorralError::NoMatchingJob);
    }
    let merged = cat_aggregate(join_all(tasks).await)?;
    Ok(Some(Value::Object(merged)))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn csv_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

async fn run_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    let user = conn.check_auth(TokenKind::User)?;
    let n_jobs: Option<usize> = request.opt_arg("n_jobs")?;
    let n_gpus: usize = request.arg("n_gpus")?;
    let name: String = request.arg("name")?;
    let image: String = request.arg("image")?;
    let exec = request
        .args
        .get("exec")
        .cloned()
        .ok_or_else(|| CorralError::BadRequest("missing field `exec`".into()))?;
    let env: Vec<String> = request.opt_arg("env")?.unwrap_or_default();
    let timeout: i64 = request.opt_arg("timeout")?.unwrap_or(0);
    let exclude = csv_list(request.opt_arg("node_exclude")?);
    let include = csv_list(request.opt_arg("node_include")?);

    // Reserved names of finalized containers count as taken too.
    let nodes = collect_nodes(central, true).await?;
    let mut available: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for (node, info) in &nodes {
        if exclude.contains(node) {
            continue;
        }
        if !include.is_empty() && !include.contains(node) {
            continue;
        }
        match n_jobs {
            None => {
                if info_names(info).any(|existing| existing == name) {
                    return Err(CorralError::ContainerExists(name));
                }
            }
            Some(n) => {
                for i in 0..n {
                    let candidate = format!("{name}-{i}");
                    if info_names(info).any(|existing| existing == candidate) {
                        return Err(CorralError::ContainerExists(candidate));
                    }
                }
            }
        }
        let free: Vec<u32> = info
            .get("free_gpu_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        available.insert(node.clone(), free);
    }
    if available.is_empty() {
        return Err(CorralError::AllNodesExcluded);
    }

    let placements = schedule(&mut available, n_jobs.unwrap_or(1), n_gpus)?;
    info!(%name, %user, jobs = placements.len(), "scheduled run");

    let mut tasks = Vec::new();
    for (i, (node, gpu_ids)) in placements.iter().enumerate() {
        let entry = central.daemon_for_node(node).ok_or(CorralError::Daemon {
            code: -1,
            msg: format!("daemon for node `{node}` disappeared"),
        })?;
        let container_name = match n_jobs {
            Some(_) => format!("{name}-{i}"),
            None => name.clone(),
        };
        let args = json!({
            "name": container_name,
            "gpu_ids": gpu_ids,
            "image": image,
            "exec": exec,
            "user": user,
            "env": env,
            "timeout": timeout,
        });
        tasks.push(async move { entry.client.issue("run_container", args).await });
    }
    let merged = cat_aggregate(join_all(tasks).await)?;
    Ok(Some(Value::Object(merged)))
}

// ---------------------------------------------------------------------------
// log following
// ---------------------------------------------------------------------------

async fn follow_logs_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let container: String = request.arg("container")?;

    let entry = owning_daemon(central, &container).await?;
    let fields = entry
        .client
        .issue("follow_logs", json!({ "container": container }))
        .await?
        .into_result()?;
    if let Some(follower) = fields.get("follower").and_then(Value::as_str) {
        central
            .followers
            .lock()
            .expect("follower map poisoned")
            .insert(follower.to_string(), entry.node.clone());
    }
    Ok(Some(Value::Object(fields)))
}

async fn poll_logs_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let follower: String = request.arg("follower")?;

    let node = central
        .followers
        .lock()
        .expect("follower map poisoned")
        .get(&follower)
        .cloned()
        .ok_or_else(|| CorralError::BadRequest(format!("unknown follower `{follower}`")))?;
    let entry = central.daemon_for_node(&node).ok_or(CorralError::Daemon {
        code: -1,
        msg: format!("daemon for node `{node}` disappeared"),
    })?;
    let fields = entry
        .client
        .issue("poll_logs", json!({ "follower": follower }))
        .await?
        .into_result()?;
    if fields.get("eof").and_then(Value::as_bool) == Some(true) {
        central
            .followers
            .lock()
            .expect("follower map poisoned")
            .remove(&follower);
    }
    Ok(Some(Value::Object(fields)))
}

// ---------------------------------------------------------------------------
// tunneling
// ---------------------------------------------------------------------------

async fn tcpconn_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let container: String = request.arg("container")?;
    let port: u16 = request.arg("port")?;

    let entry = owning_daemon(central, &container).await?;
    let fields = entry
        .client
        .issue(
            "tcpconn",
            json!({ "client": request.ticket, "container": container, "port": port }),
        )
        .await?
        .into_result()?;

    central.tunnels.insert(
        request.ticket.clone(),
        Arc::new(TunnelRoute {
            client: conn.clone(),
            daemon: entry,
            gate: SequencedGate::new(),
            inflight: AtomicUsize::new(0),
        }),
    );
    info!(ticket = %request.ticket, %container, port, "tunnel established");
    Ok(Some(Value::Object(fields)))
}

async fn tcpsend_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let client: String = request.arg("client")?;
    let _p: u64 = request.arg("p")?;

    let route = central
        .tunnels
        .wait_for(&client, tunnel::ROUTE_WAIT)
        .await
        .ok_or_else(|| CorralError::TunnelNotFound(client.clone()))?;
    // Relayed verbatim; the daemon applies ordering by `p`.
    let _ = route.daemon.conn.outgoing.send(request.to_line());
    Ok(None)
}

async fn tcpstop_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let client: String = request.arg("client")?;
    let p: u64 = request.arg("p")?;

    let route = central
        .tunnels
        .remove(&client)
        .ok_or_else(|| CorralError::TunnelNotFound(client.clone()))?;
    let fields = route
        .daemon
        .client
        .issue("tcpstop", json!({ "client": client, "p": p }))
        .await?
        .into_result()?;
    info!(ticket = %client, "tunnel stopped");
    Ok(Some(Value::Object(fields)))
}

async fn tcpfwd2_handler(
    central: &Arc<Central>,
    conn: &Arc<ClientConn>,
    request: &Request,
) -> Result<Option<Value>, CorralError> {
    conn.check_auth(TokenKind::User)?;
    let container: String = request.arg("container")?;
    let port: u16 = request.arg("port")?;

    let entry = owning_daemon(central, &container).await?;
    let session = Uuid::new_v4().to_string();
    entry
        .client
        .issue(
            "tcpfwd2",
            json!({ "session": session, "container": container, "port": port }),
        )
        .await?
        .into_result()?;
    info!(%session, %container, port, "v2 tunnel session allocated");
    Ok(Some(json!({ "session": session })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_membership_requires_numeric_suffix() {
        assert!(is_job_member("train-0", "train"));
        assert!(is_job_member("train-15", "train"));
        assert!(!is_job_member("train", "train"));
        assert!(!is_job_member("train-", "train"));
        assert!(!is_job_member("train-x", "train"));
        assert!(!is_job_member("train-0-b", "train"));
        assert!(!is_job_member("retrain-0", "train"));
    }

    #[test]
    fn csv_lists_drop_empty_entries() {
        assert_eq!(csv_list(Some("a,b".into())), vec!["a", "b"]);
        assert_eq!(csv_list(Some(",a,,".into())), vec!["a"]);
        assert!(csv_list(Some(String::new())).is_empty());
        assert!(csv_list(None).is_empty());
    }
}
