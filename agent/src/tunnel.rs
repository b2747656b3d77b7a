//! Daemon-side tunnel endpoints.
//!
//! v1: one [`TcpConn`] per tunnel ticket wraps a local socket into the
//! container's port. Client-bound bytes are read in 16 KiB chunks and
//! shipped upstream as `tcprecv` frames with a running sequence number;
//! container-bound `tcpsend` frames are applied in sequence order
//! through a gate. The central installs a pause latch when its relay
//! window fills. v2: dial the central back on a raw side-channel and
//! splice it against the local socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use corral_core::error::CorralError;
use corral_core::gate::SequencedGate;
use corral_core::protocol::Request;

/// Read size on the container-side socket.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// v1 connections idle this long are garbage-collected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long `tcpstop` waits for in-flight writes to drain.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read timeout on v2 side-channels.
const V2_IDLE: Duration = Duration::from_secs(1800);

/// Daemon-side state of one v1 tunnel.
pub struct TcpConn {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    gate: SequencedGate,
    paused: watch::Sender<bool>,
    last_active: Arc<Mutex<Instant>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConn {
    fn touch(&self) {
        *self.last_active.lock().expect("tunnel clock poisoned") = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_active.lock().expect("tunnel clock poisoned"))
    }
}

#[derive(Default)]
pub struct TunnelRegistry {
    conns: Mutex<HashMap<String, Arc<TcpConn>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, client: &str) -> Result<Arc<TcpConn>, CorralError> {
        self.conns
            .lock()
            .expect("tunnel registry poisoned")
            .get(client)
            .cloned()
            .ok_or_else(|| CorralError::TunnelNotFound(client.to_string()))
    }

    /// Open a local socket to `127.0.0.1:port` (managed containers run
    /// with host networking) and start pumping container-bound output
    /// upstream as `tcprecv` frames.
    pub async fn open(
        &self,
        client: String,
        port: u16,
        outgoing: mpsc::UnboundedSender<String>,
    ) -> Result<(), CorralError> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| CorralError::Internal(format!("connect to 127.0.0.1:{port}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let (pause_tx, pause_rx) = watch::channel(false);
        let last_active = Arc::new(Mutex::new(Instant::now()));

        let conn = Arc::new(TcpConn {
            writer: tokio::sync::Mutex::new(write_half),
            gate: SequencedGate::new(),
            paused: pause_tx,
            last_active: last_active.clone(),
            reader: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(
            client.clone(),
            read_half,
            pause_rx,
            outgoing,
            last_active,
        ));
        *conn.reader.lock().expect("reader slot poisoned") = Some(task);

        self.conns
            .lock()
            .expect("tunnel registry poisoned")
            .insert(client.clone(), conn);
        info!(%client, port, "tunnel opened");
        Ok(())
    }

    /// Apply one client-originated chunk in sequence order.
    pub async fn apply_send(&self, client: &str, data: &[u8], p: u64) -> Result<(), CorralError> {
        let conn = self.get(client)?;
        conn.gate.wait_for(p).await;
        let result = conn.writer.lock().await.write_all(data).await;
        // Advance even on failure so later frames fail fast instead of
        // waiting forever.
        conn.gate.advance();
        conn.touch();
        result.map_err(|e| CorralError::Internal(format!("tunnel write: {e}")))
    }

    /// Install or clear the flow-control latch.
    pub fn set_paused(&self, client: &str, paused: bool) -> Result<(), CorralError> {
        let conn = self.get(client)?;
        conn.paused.send_replace(paused);
        debug!(%client, paused, "tunnel flow latch");
        Ok(())
    }

    /// Drain pending writes up to `p`, then close the local socket.
    pub async fn stop(&self, client: &str, p: u64) -> Result<(), CorralError> {
        let conn = self
            .conns
            .lock()
            .expect("tunnel registry poisoned")
            .remove(client)
            .ok_or_else(|| CorralError::TunnelNotFound(client.to_string()))?;

        let _ = tokio::time::timeout(STOP_DRAIN_TIMEOUT, conn.gate.wait_for(p)).await;
        let _ = conn.writer.lock().await.shutdown().await;
        if let Some(task) = conn.reader.lock().expect("reader slot poisoned").take() {
            task.abort();
        }
        info!(%client, "tunnel stopped");
        Ok(())
    }

    /// Close connections whose cursor has not moved for
    /// [`IDLE_TIMEOUT`].
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale: Vec<(String, Arc<TcpConn>)> = {
            let mut conns = self.conns.lock().expect("tunnel registry poisoned");
            let stale_keys: Vec<String> = conns
                .iter()
                .filter(|(_, conn)| conn.idle_for(now) > IDLE_TIMEOUT)
                .map(|(key, _)| key.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| conns.remove(&key).map(|conn| (key, conn)))
                .collect()
        };
        for (client, conn) in stale {
            warn!(%client, "garbage-collecting idle tunnel");
            if let Some(task) = conn.reader.lock().expect("reader slot poisoned").take() {
                task.abort();
            }
            tokio::spawn(async move {
                let _ = conn.writer.lock().await.shutdown().await;
            });
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().expect("tunnel registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn read_loop(
    client: String,
    mut read_half: OwnedReadHalf,
    mut pause_rx: watch::Receiver<bool>,
    outgoing: mpsc::UnboundedSender<String>,
    last_active: Arc<Mutex<Instant>>,
) {
    let mut seq = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        // Flow latch: block before the next read while paused.
        while *pause_rx.borrow() {
            if pause_rx.changed().await.is_err() {
                return;
            }
        }
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let frame = Request::new(
            Uuid::new_v4().to_string(),
            "tcprecv",
            json!({
                "client": client,
                "d": BASE64.encode(&buf[..n]),
                "p": seq,
            }),
        );
        if outgoing.send(frame.to_line()).is_err() {
            break;
        }
        seq += 1;
        *last_active.lock().expect("tunnel clock poisoned") = Instant::now();
    }
    debug!(%client, frames = seq, "tunnel read loop ended");
}

// ---------------------------------------------------------------------------
// v2: raw side-channel dial-back
// ---------------------------------------------------------------------------

/// Open the local socket and a raw side-channel to the central, then
/// splice them in the background. Returns once both connections are up.
pub async fn open_v2(central_host: &str, session: &str, port: u16) -> Result<(), CorralError> {
    let local = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| CorralError::Internal(format!("connect to 127.0.0.1:{port}: {e}")))?;
    let mut side = TcpStream::connect(central_host)
        .await
        .map_err(|e| CorralError::Internal(format!("connect to central {central_host}: {e}")))?;

    let mut hello = json!({ "tcp2": { "role": "d", "session": session } }).to_string();
    hello.push('\n');
    side.write_all(hello.as_bytes())
        .await
        .map_err(|e| CorralError::Internal(format!("side-channel hello: {e}")))?;

    let session = session.to_string();
    tokio::spawn(async move {
        let (local_read, local_write) = local.into_split();
        let (side_read, side_write) = side.into_split();
        tokio::select! {
            _ = pump(local_read, side_write) => {}
            _ = pump(side_read, local_write) => {}
        }
        debug!(%session, "v2 tunnel closed");
    });
    Ok(())
}

async fn pump<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match tokio::time::timeout(V2_IDLE, reader.read(&mut buf)).await {
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
    use corral_core::protocol::Frame;
    use tokio::net::TcpListener;

    async fn listen_local() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn out_of_order_sends_arrive_in_order() {
        let (listener, port) = listen_local().await;
        let registry = Arc::new(TunnelRegistry::new());
        let (outgoing, _rx) = mpsc::unbounded_channel();

        registry
            .open("tick".into(), port, outgoing)
            .await
            .unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();

        // Deliver sequence 1 before sequence 0; the socket must still
        // observe "zero-one-".
        let r1 = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.apply_send("tick", b"one-", 1).await })
        };
        tokio::task::yield_now().await;
        registry.apply_send("tick", b"zero-", 0).await.unwrap();
        r1.await.unwrap().unwrap();

        let mut buf = [0u8; 9];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"zero-one-");
    }

    #[tokio::test]
    async fn container_output_becomes_sequenced_tcprecv_frames() {
        let (listener, port) = listen_local().await;
        let registry = TunnelRegistry::new();
        let (outgoing, mut rx) = mpsc::unbounded_channel();

        registry
            .open("tick".into(), port, outgoing)
            .await
            .unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();

        sock.write_all(b"hello").await.unwrap();
        sock.flush().await.unwrap();

        let line = rx.recv().await.unwrap();
        let Frame::Request(req) = Frame::parse(&line).unwrap() else {
            panic!("expected request frame");
        };
        assert_eq!(req.cmd, "tcprecv");
        assert_eq!(req.arg::<String>("client").unwrap(), "tick");
        assert_eq!(req.arg::<u64>("p").unwrap(), 0);
        let data = BASE64.decode(req.arg::<String>("d").unwrap()).unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn pause_latch_blocks_further_frames() {
        let (listener, port) = listen_local().await;
        let registry = TunnelRegistry::new();
        let (outgoing, mut rx) = mpsc::unbounded_channel();

        registry
            .open("tick".into(), port, outgoing)
            .await
            .unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();

        sock.write_all(b"a").await.unwrap();
        let _ = rx.recv().await.unwrap();

        // Latch down: the chunk in flight may pass, nothing after it.
        registry.set_paused("tick", true).unwrap();
        sock.write_all(b"b").await.unwrap();
        let _inflight = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        sock.write_all(b"c").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err(),
            "frame delivered while paused"
        );

        registry.set_paused("tick", false).unwrap();
        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame after resume")
            .unwrap();
        assert!(line.contains("tcprecv"));
    }

    #[tokio::test]
    async fn stop_drains_pending_writes_before_closing() {
        let (listener, port) = listen_local().await;
        let registry = Arc::new(TunnelRegistry::new());
        let (outgoing, _rx) = mpsc::unbounded_channel();

        registry
            .open("tick".into(), port, outgoing)
            .await
            .unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();

        for (i, chunk) in [b"aa", b"bb", b"cc"].iter().enumerate() {
            registry
                .apply_send("tick", *chunk, i as u64)
                .await
                .unwrap();
        }
        registry.stop("tick", 3).await.unwrap();

        let mut collected = Vec::new();
        sock.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"aabbcc");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_tunnel_is_reported() {
        let registry = TunnelRegistry::new();
        let err = registry.apply_send("ghost", b"x", 0).await.unwrap_err();
        assert_eq!(err.code(), 18);
        assert_eq!(registry.set_paused("ghost", true).unwrap_err().code(), 18);
    }
}
