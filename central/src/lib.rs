//! The corral central: accepts every connection in the cluster, routes
//! client commands, owns the daemon registry and the tunnel routing
//! table, and makes the scheduling decision for `run`.

pub mod aggregate;
pub mod dispatch;
pub mod server;
pub mod state;
pub mod tunnel;

pub use server::serve;
pub use state::Central;

/// Default listen address; loopback because daemons and clients reach
/// the central through an external reverse proxy or SSH forward.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:23549";
