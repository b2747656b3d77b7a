//! Outbound connection to the central.
//!
//! The daemon dials the central, authenticates with a self-issued
//! daemon token, registers, and then serves inbound commands until the
//! connection dies. The caller drives reconnection.

use std::sync::Arc;

use serde_json::json;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use corral_core::auth::{self, TokenKind};
use corral_core::protocol::{Frame, Request};
use corral_core::transport::{read_frame_line, serial_call, spawn_writer, MAX_FRAME_DAEMON};

use crate::node::Node;
use crate::ops;

/// Daemon tokens are short-lived; the verification leeway makes them
/// effectively session-scoped.
const DAEMON_TOKEN_EXP: u64 = 300;

/// One connection lifetime: connect, auth, register, serve.
pub async fn one_pass(node: Arc<Node>) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&node.cfg.central_host).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    let token = auth::issue(
        &node.hostname,
        TokenKind::Daemon,
        DAEMON_TOKEN_EXP,
        &node.cfg.jwt_key,
    )?;
    let response = serial_call(
        &mut reader,
        &mut writer,
        "auth",
        json!({ "token": token }),
        MAX_FRAME_DAEMON,
    )
    .await?;
    if response.code != 0 {
        let msg = response
            .fields
            .get("msg")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        anyhow::bail!("authentication failed: {msg}");
    }

    let outgoing = spawn_writer(writer);

    // Registration gets no reply; the connection is the registration.
    let register = Request::new(Uuid::new_v4().to_string(), "daemon", json!({}));
    outgoing
        .send(register.to_line())
        .map_err(|_| anyhow::anyhow!("connection closed before registration"))?;
    info!(node = %node.hostname, "registered with central");

    loop {
        let line = match read_frame_line(&mut reader, MAX_FRAME_DAEMON).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("closing central connection: {err}");
                break;
            }
        };
        match Frame::parse(&line) {
            Ok(Frame::Request(request)) => {
                let node = node.clone();
                let outgoing = outgoing.clone();
                tokio::spawn(async move {
                    ops::dispatch_frame(node, outgoing, request).await;
                });
            }
            Ok(Frame::Response(response)) => {
                debug!(ticket = %response.ticket, "ignoring stray response frame");
            }
            Err(err) => {
                warn!("closing central connection on bad frame: {err}");
                break;
            }
        }
    }
    Ok(())
}
