//! Central-side state.
//!
//! One [`Central`] object owns everything the handlers touch: the
//! daemon registry, the v1 tunnel route table, pending v2 splice
//! halves, and the follower routing map. Connection-scoped state lives
//! in [`ClientConn`], created on accept and dropped on close — nothing
//! here survives a disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use corral_core::auth::TokenKind;
use corral_core::config::Config;
use corral_core::error::CorralError;
use corral_core::protocol::client::AsyncClient;

use crate::tunnel::{SpliceTable, TunnelTable};

pub type ConnId = u64;

/// Authentication state of one connection, `unauth` until a valid
/// `auth` command arrives.
#[derive(Default)]
pub struct AuthState {
    pub kind: Option<TokenKind>,
    pub name: Option<String>,
}

/// Per-connection state at the central.
pub struct ClientConn {
    pub id: ConnId,
    /// Feed of the connection's writer task; every outbound frame for
    /// this peer goes through here.
    pub outgoing: mpsc::UnboundedSender<String>,
    pub auth: Mutex<AuthState>,
    /// Set once the peer registers via the `daemon` command; the reader
    /// loop then treats inbound frames as replies (or daemon-originated
    /// tunnel data) instead of fresh commands.
    pub daemon: Mutex<Option<Arc<DaemonEntry>>>,
}

impl ClientConn {
    pub fn new(id: ConnId, outgoing: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            outgoing,
            auth: Mutex::new(AuthState::default()),
            daemon: Mutex::new(None),
        }
    }

    /// The authenticated name, gated on the expected kind.
    pub fn check_auth(&self, expected: TokenKind) -> Result<String, CorralError> {
        let auth = self.auth.lock().expect("auth state poisoned");
        match (&auth.kind, &auth.name) {
            (Some(kind), Some(name)) if *kind == expected => Ok(name.clone()),
            _ => Err(CorralError::NoPermission),
        }
    }

    pub fn registered_daemon(&self) -> Option<Arc<DaemonEntry>> {
        self.daemon.lock().expect("daemon slot poisoned").clone()
    }
}

/// A connected, authenticated daemon: registry member for exactly as
/// long as its connection lives.
pub struct DaemonEntry {
    pub node: String,
    pub conn: Arc<ClientConn>,
    pub client: AsyncClient,
}

/// The whole of the central's mutable state.
pub struct Central {
    pub cfg: Config,
    next_conn_id: AtomicU64,
    pub daemons: RwLock<HashMap<ConnId, Arc<DaemonEntry>>>,
    pub tunnels: TunnelTable,
    pub splices: SpliceTable,
    /// follower id → node name, so `poll_logs` reaches the daemon that
    /// created the follower.
    pub followers: Mutex<HashMap<String, String>>,
}

impl Central {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            next_conn_id: AtomicU64::new(1),
            daemons: RwLock::new(HashMap::new()),
            tunnels: TunnelTable::new(),
            splices: SpliceTable::new(),
            followers: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of the registry for a broadcast.
    pub fn daemon_entries(&self) -> Vec<Arc<DaemonEntry>> {
        self.daemons
            .read()
            .expect("daemon registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// The registered daemon for `node`, if any.
    pub fn daemon_for_node(&self, node: &str) -> Option<Arc<DaemonEntry>> {
        self.daemons
            .read()
            .expect("daemon registry poisoned")
            .values()
            .find(|entry| entry.node == node)
            .cloned()
    }

    pub fn register_daemon(&self, entry: Arc<DaemonEntry>) {
        self.daemons
            .write()
            .expect("daemon registry poisoned")
            .insert(entry.conn.id, entry);
    }

    /// Tear down everything bound to a closing connection: registry
    /// membership, outstanding tickets, tunnel routes on either end,
    /// and follower routes owned by a departing daemon.
    pub fn drop_connection(&self, conn: &ClientConn) {
        let removed = self
            .daemons
            .write()
            .expect("daemon registry poisoned")
            .remove(&conn.id);
        if let Some(entry) = removed {
            entry.client.abort_all();
            self.followers
                .lock()
                .expect("follower map poisoned")
                .retain(|_, node| *node != entry.node);
        }
        self.tunnels.drop_for_connection(conn.id);
    }
}
