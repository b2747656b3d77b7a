//! Local port forwarding over v2 tunnel side-channels.
//!
//! Listens on the local port; every accepted connection gets its own
//! tunnel session: the central pairs our raw side-channel with the
//! daemon's dial-back and splices them.

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use corral_core::protocol::Response;

use crate::connection::Connection;

/// Idle read timeout, matching the central's splice timeout.
const IDLE: std::time::Duration = std::time::Duration::from_secs(1800);

const CHUNK_SIZE: usize = 16 * 1024;

/// Serve `container:remote` on the local port until interrupted.
pub async fn run(
    conn: &mut Connection,
    container: &str,
    port_spec: &str,
) -> anyhow::Result<Response> {
    let (remote, local) = parse_port_spec(port_spec)?;

    let listener = TcpListener::bind(("127.0.0.1", local)).await?;
    println!("[info] serving on port {local}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("[info] stopping port forward");
                break;
            }
            accepted = listener.accept() => {
                let (sock, _) = accepted?;
                println!("[info] got connection on port {local}");

                // One session per connection; the daemon dials back per
                // session.
                let response = conn
                    .call("tcpfwd2", json!({ "container": container, "port": remote }))
                    .await?;
                if response.code != 0 {
                    return Ok(response);
                }
                let Some(session) = response.fields.get("session").and_then(Value::as_str) else {
                    anyhow::bail!("central returned no session id");
                };
                println!("[info] start forwarding to port {remote}");
                tokio::spawn(forward(conn.addr.clone(), session.to_string(), sock));
            }
        }
    }
    Ok(Response::ok("", json!({})))
}

/// `remote` or `remote:local`.
fn parse_port_spec(spec: &str) -> anyhow::Result<(u16, u16)> {
    match spec.split_once(':') {
        Some((remote, local)) => Ok((remote.parse()?, local.parse()?)),
        None => {
            let port: u16 = spec.parse()?;
            Ok((port, port))
        }
    }
}

/// Open the raw side-channel and splice it against the local socket.
async fn forward(addr: String, session: String, sock: TcpStream) {
    let side = match TcpStream::connect(&addr).await {
        Ok(side) => side,
        Err(err) => {
            println!("[error] side-channel connect failed: {err}");
            return;
        }
    };
    let mut side = side;
    let mut hello = json!({ "tcp2": { "role": "c", "session": session } }).to_string();
    hello.push('\n');
    if side.write_all(hello.as_bytes()).await.is_err() {
        println!("[error] side-channel hello failed");
        return;
    }

    let (side_read, side_write) = side.into_split();
    let (sock_read, sock_write) = sock.into_split();
    tokio::select! {
        _ = pump(side_read, sock_write) => {}
        _ = pump(sock_read, side_write) => {}
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match tokio::time::timeout(IDLE, reader.read(&mut buf)).await {
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
