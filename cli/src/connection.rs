//! The client's connection to the central.
//!
//! The CLI issues commands strictly one at a time, so a serial
//! request/response exchange per call is all it needs; tunnels use
//! separate raw side-channel connections.

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use corral_core::protocol::Response;
use corral_core::transport::{serial_call, TransportError, MAX_FRAME_DAEMON};

pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pub addr: String,
    token: String,
}

impl Connection {
    /// Connect and authenticate; the auth response is returned so the
    /// caller can report the login outcome.
    pub async fn connect(addr: &str, token: &str) -> anyhow::Result<(Self, Response)> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            addr: addr.to_string(),
            token: token.to_string(),
        };
        let auth = conn.call("auth", json!({ "token": token })).await?;
        Ok((conn, auth))
    }

    /// One request/response exchange.
    pub async fn call(&mut self, cmd: &str, args: Value) -> anyhow::Result<Response> {
        Ok(serial_call(&mut self.reader, &mut self.writer, cmd, args, MAX_FRAME_DAEMON).await?)
    }

    /// Drop the current connection and dial again.
    pub async fn reconnect(&mut self) -> anyhow::Result<Response> {
        let addr = self.addr.clone();
        let token = self.token.clone();
        let (conn, auth) = Self::connect(&addr, &token).await?;
        *self = conn;
        Ok(auth)
    }
}

/// Whether a failed call means the connection itself is gone, as
/// opposed to a protocol-level problem on a live connection.
pub fn is_connection_lost(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TransportError>(),
        Some(TransportError::Io(_) | TransportError::Closed)
    )
}
