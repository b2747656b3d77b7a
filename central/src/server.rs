//! Connection handling at the central.
//!
//! One reader loop per accepted connection. The first line decides the
//! connection's fate: a v2 splice hello hands the raw stream to the
//! tunnel module, anything else starts a framed session. On framed
//! sessions each request is dispatched on its own task; once the peer
//! registers as a daemon, inbound frames are treated as replies (or
//! daemon-originated tunnel data) instead of fresh commands.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use corral_core::protocol::Frame;
use corral_core::transport::{read_frame_line, spawn_writer, MAX_FRAME_CENTRAL};

use crate::dispatch::dispatch_frame;
use crate::state::{Central, ClientConn};
use crate::tunnel;

/// Accept connections until the cancellation token fires.
pub async fn serve(
    central: Arc<Central>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown signal received, stopping listener");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let central = central.clone();
                tokio::spawn(async move {
                    handle_connection(central, stream, peer).await;
                });
            }
        }
    }
    Ok(())
}

async fn handle_connection(central: Arc<Central>, stream: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let first = match read_frame_line(&mut reader, MAX_FRAME_CENTRAL).await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(err) => {
            warn!(%peer, "dropping connection on bad first line: {err}");
            return;
        }
    };

    // v2 side-channels never speak the framed protocol; they announce
    // themselves once and then go raw.
    if let Some(hello) = tunnel::parse_splice_hello(&first) {
        tunnel::run_splice(central, hello, reader, write_half).await;
        return;
    }

    let outgoing = spawn_writer(write_half);
    let conn = Arc::new(ClientConn::new(central.next_conn_id(), outgoing));
    info!(%peer, conn = conn.id, "connection opened");

    let mut pending = Some(first);
    loop {
        let line = match pending.take() {
            Some(line) => line,
            None => match read_frame_line(&mut reader, MAX_FRAME_CENTRAL).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(%peer, conn = conn.id, "closing connection: {err}");
                    break;
                }
            },
        };
        if !process_line(&central, &conn, &line) {
            break;
        }
    }

    central.drop_connection(&conn);
    info!(%peer, conn = conn.id, "connection closed");
}

/// Handle one inbound line; `false` tears the connection down.
fn process_line(central: &Arc<Central>, conn: &Arc<ClientConn>, line: &str) -> bool {
    // Daemon bypass: on a registered daemon connection, frames are
    // replies to outstanding tickets or daemon-originated tunnel data.
    if let Some(entry) = conn.registered_daemon() {
        match Frame::parse(line) {
            Ok(Frame::Response(response)) => {
                if !entry.client.resolve(response) {
                    warn!(node = %entry.node, "reply for unknown ticket dropped");
                }
            }
            Ok(Frame::Request(request)) if request.cmd == "tcprecv" => {
                let central = central.clone();
                tokio::spawn(async move {
                    tunnel::handle_recv(&central, request).await;
                });
            }
            Ok(Frame::Request(request)) => {
                warn!(node = %entry.node, cmd = %request.cmd, "unexpected command from daemon");
            }
            Err(err) => {
                warn!(node = %entry.node, "closing daemon connection: {err}");
                return false;
            }
        }
        return true;
    }

    match Frame::parse(line) {
        Ok(Frame::Request(request)) => {
            let central = central.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                dispatch_frame(central, conn, request).await;
            });
            true
        }
        Ok(Frame::Response(_)) => {
            warn!(conn = conn.id, "unexpected response frame from client");
            true
        }
        Err(err) => {
            warn!(conn = conn.id, "closing connection: {err}");
            false
        }
    }
}
