//! Tunnel routing at the central.
//!
//! v1 rides the framed channel: `tcpsend` frames are relayed verbatim
//! to the owning daemon, `tcprecv` frames come back as daemon-originated
//! commands and are forwarded to the client in sequence order under a
//! credit window. v2 splices two raw side-channel TCP streams matched
//! by session id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use corral_core::gate::SequencedGate;
use corral_core::protocol::Request;

use crate::state::{Central, ClientConn, ConnId, DaemonEntry};

/// Pause the daemon's read loop once this many frames are in flight.
const WINDOW_PAUSE: usize = 8;

/// Resume once in-flight drops back to this many.
const WINDOW_RESUME: usize = 4;

/// How long `tcpsend` waits for its route to appear.
pub const ROUTE_WAIT: Duration = Duration::from_millis(1500);

/// Idle read timeout on v2 side-channels.
const SPLICE_IDLE: Duration = Duration::from_secs(1800);

/// Central-side state of one v1 tunnel, keyed by the `tcpconn` ticket.
pub struct TunnelRoute {
    pub client: Arc<ClientConn>,
    pub daemon: Arc<DaemonEntry>,
    pub gate: SequencedGate,
    pub inflight: AtomicUsize,
}

pub struct TunnelTable {
    routes: Mutex<HashMap<String, Arc<TunnelRoute>>>,
    inserted: Notify,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            inserted: Notify::new(),
        }
    }

    pub fn insert(&self, ticket: String, route: Arc<TunnelRoute>) {
        self.routes
            .lock()
            .expect("route table poisoned")
            .insert(ticket, route);
        self.inserted.notify_waiters();
    }

    pub fn get(&self, ticket: &str) -> Option<Arc<TunnelRoute>> {
        self.routes
            .lock()
            .expect("route table poisoned")
            .get(ticket)
            .cloned()
    }

    pub fn remove(&self, ticket: &str) -> Option<Arc<TunnelRoute>> {
        self.routes
            .lock()
            .expect("route table poisoned")
            .remove(ticket)
    }

    /// Wait (bounded) for a route to appear. `tcpsend` can race the
    /// `tcpconn` that creates the route on another task.
    pub async fn wait_for(&self, ticket: &str, timeout: Duration) -> Option<Arc<TunnelRoute>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(route) = self.get(ticket) {
                return Some(route);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return self.get(ticket);
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.get(ticket);
            }
        }
    }

    /// Forget every route with an endpoint on a closing connection.
    pub fn drop_for_connection(&self, conn: ConnId) {
        self.routes
            .lock()
            .expect("route table poisoned")
            .retain(|_, route| route.client.id != conn && route.daemon.conn.id != conn);
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward one daemon-originated `tcprecv` frame to its client, in
/// sequence order, maintaining the 4–8 credit window.
pub async fn handle_recv(central: &Central, request: Request) {
    let Some(client_ticket) = request
        .args
        .get("client")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return;
    };
    // Route already gone: the tunnel was stopped under the daemon.
    let Some(route) = central.tunnels.get(&client_ticket) else {
        debug!(client = %client_ticket, "tcprecv for unknown route dropped");
        return;
    };
    let Ok(p) = request.arg::<u64>("p") else {
        warn!(client = %client_ticket, "tcprecv without sequence number dropped");
        return;
    };

    let inflight = route.inflight.fetch_add(1, Ordering::AcqRel) + 1;
    if inflight == WINDOW_PAUSE {
        let _ = route
            .daemon
            .client
            .issue("tcpflowpause", json!({ "client": client_ticket }))
            .await;
    }

    route.gate.wait_for(p).await;
    let _ = route.client.outgoing.send(request.to_line());
    route.gate.advance();

    let inflight = route.inflight.fetch_sub(1, Ordering::AcqRel) - 1;
    if inflight == WINDOW_RESUME {
        let _ = route
            .daemon
            .client
            .issue("tcpflowresume", json!({ "client": client_ticket }))
            .await;
    }
}

// ---------------------------------------------------------------------------
// v2: raw side-channel splicing
// ---------------------------------------------------------------------------

pub type SpliceReader = BufReader<OwnedReadHalf>;
pub type SpliceWriter = OwnedWriteHalf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceRole {
    Client,
    Daemon,
}

#[derive(Debug, Clone)]
pub struct SpliceHello {
    pub role: SpliceRole,
    pub session: String,
}

/// Recognize a v2 side-channel hello: `{"tcp2":{"role":"c","session":…}}`.
/// Anything else is a normal frame and is handled by the dispatcher.
pub fn parse_splice_hello(line: &str) -> Option<SpliceHello> {
    let value: Value = serde_json::from_str(line).ok()?;
    let hello = value.get("tcp2")?;
    let role = match hello.get("role")?.as_str()? {
        "c" => SpliceRole::Client,
        "d" => SpliceRole::Daemon,
        _ => return None,
    };
    let session = hello.get("session")?.as_str()?.to_string();
    Some(SpliceHello { role, session })
}

struct PendingHalf {
    role: SpliceRole,
    reader: SpliceReader,
    writer: SpliceWriter,
    parked_at: Instant,
}

/// Session-keyed rendezvous for the two halves of a v2 tunnel.
pub struct SpliceTable {
    pending: Mutex<HashMap<String, PendingHalf>>,
}

impl SpliceTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SpliceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Park or pair one side-channel connection. When both halves of a
/// session have arrived, splice them until one side reaches EOF.
pub async fn run_splice(
    central: Arc<Central>,
    hello: SpliceHello,
    reader: SpliceReader,
    writer: SpliceWriter,
) {
    let parked_at = Instant::now();
    let mut reader = Some(reader);
    let mut writer = Some(writer);
    let peer = {
        let mut pending = central.splices.pending.lock().expect("splice table poisoned");
        match pending.remove(&hello.session) {
            Some(half) if half.role != hello.role => Some(half),
            Some(half) => {
                // Same role twice: the newcomer replaces the stale half.
                warn!(session = %hello.session, "duplicate splice role, dropping stale half");
                pending.insert(
                    hello.session.clone(),
                    PendingHalf {
                        role: hello.role,
                        reader: reader.take().expect("reader present"),
                        writer: writer.take().expect("writer present"),
                        parked_at,
                    },
                );
                drop(half);
                return spawn_expiry(central.clone(), hello.session, parked_at);
            }
            None => {
                pending.insert(
                    hello.session.clone(),
                    PendingHalf {
                        role: hello.role,
                        reader: reader.take().expect("reader present"),
                        writer: writer.take().expect("writer present"),
                        parked_at,
                    },
                );
                None
            }
        }
    };

    match peer {
        Some(half) => {
            info!(session = %hello.session, "splicing tunnel streams");
            splice_streams(
                reader.take().expect("reader present"),
                writer.take().expect("writer present"),
                half.reader,
                half.writer,
            )
            .await;
            info!(session = %hello.session, "tunnel streams closed");
        }
        None => spawn_expiry(central, hello.session, parked_at),
    }
}

/// A parked half whose peer never shows up is dropped after the idle
/// timeout.
fn spawn_expiry(central: Arc<Central>, session: String, parked_at: Instant) {
    tokio::spawn(async move {
        tokio::time::sleep(SPLICE_IDLE).await;
        let mut pending = central.splices.pending.lock().expect("splice table poisoned");
        if pending
            .get(&session)
            .is_some_and(|half| half.parked_at == parked_at)
        {
            warn!(session = %session, "splice half expired unmatched");
            pending.remove(&session);
        }
    });
}

async fn splice_streams(
    a_reader: SpliceReader,
    a_writer: SpliceWriter,
    b_reader: SpliceReader,
    b_writer: SpliceWriter,
) {
    // First EOF (or idle timeout) cancels the other direction, which
    // drops its halves and closes both sockets.
    tokio::select! {
        _ = pump(a_reader, b_writer) => {}
        _ = pump(b_reader, a_writer) => {}
    }
}

async fn pump(mut reader: SpliceReader, mut writer: SpliceWriter) {
    let mut buf = [0u8; 16384];
    loop {
        let n = match tokio::time::timeout(SPLICE_IDLE, reader.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => break,
        };
        if n == 0 {
            break;
        }
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_parses_both_roles() {
        let hello =
            parse_splice_hello(r#"{"tcp2":{"role":"c","session":"s-1"}}"#).expect("client hello");
        assert_eq!(hello.role, SpliceRole::Client);
        assert_eq!(hello.session, "s-1");

        let hello =
            parse_splice_hello(r#"{"tcp2":{"role":"d","session":"s-1"}}"#).expect("daemon hello");
        assert_eq!(hello.role, SpliceRole::Daemon);
    }

    #[test]
    fn ordinary_frames_are_not_hellos() {
        assert!(parse_splice_hello(r#"{"ticket":"t","cmd":"ps"}"#).is_none());
        assert!(parse_splice_hello(r#"{"tcp2":{"role":"x","session":"s"}}"#).is_none());
        assert!(parse_splice_hello("not json").is_none());
    }
}
