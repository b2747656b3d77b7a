//! Shared fixtures: an in-process central, raw test clients, and
//! scriptable fake daemons speaking the real wire protocol.

// Each integration test is compiled as its own crate, so not every test
// file uses every helper here. Suppress dead_code warnings.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corral_central::{serve, Central};
use corral_core::auth::{issue, TokenKind};
use corral_core::config::Config;
use corral_core::protocol::{Frame, Request, Response};
use corral_core::transport::{read_frame_line, serial_call, spawn_writer, MAX_FRAME_DAEMON};

pub const KEY: &str = "integration-test-key";

pub fn test_config() -> Config {
    serde_json::from_value(json!({
        "jwt_key": KEY,
        "central_host": "127.0.0.1:0",
    }))
    .expect("test config")
}

/// Boot a central on an ephemeral port; returns its address.
pub async fn start_central() -> (String, Arc<Central>, CancellationToken) {
    let central = Arc::new(Central::new(test_config()));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let shutdown = CancellationToken::new();
    let serve_central = central.clone();
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = serve(serve_central, listener, serve_shutdown).await;
    });
    (addr, central, shutdown)
}

pub struct TestClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Connect and authenticate as a user.
    pub async fn connect_user(addr: &str, user: &str) -> Self {
        let mut client = Self::connect(addr).await;
        let token = issue(user, TokenKind::User, 3600, KEY).expect("token");
        let response = client.call("auth", json!({ "token": token })).await;
        assert_eq!(response.code, 0, "auth failed: {:?}", response.fields);
        client
    }

    /// Serial request/response exchange.
    pub async fn call(&mut self, cmd: &str, args: Value) -> Response {
        tokio::time::timeout(
            Duration::from_secs(5),
            serial_call(&mut self.reader, &mut self.writer, cmd, args, MAX_FRAME_DAEMON),
        )
        .await
        .expect("call timed out")
        .expect("call failed")
    }

    /// Fire a request without waiting for its response.
    pub async fn send(&mut self, ticket: &str, cmd: &str, args: Value) {
        let line = Request::new(ticket, cmd, args).to_line();
        corral_core::transport::write_line(&mut self.writer, &line)
            .await
            .expect("send");
    }

    /// Next inbound frame, bounded.
    pub async fn recv(&mut self) -> Frame {
        let line = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame_line(&mut self.reader, MAX_FRAME_DAEMON),
        )
        .await
        .expect("recv timed out")
        .expect("recv failed")
        .expect("connection closed");
        Frame::parse(&line).expect("bad frame")
    }

    /// Next inbound frame, or `None` within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        match tokio::time::timeout(wait, read_frame_line(&mut self.reader, MAX_FRAME_DAEMON)).await
        {
            Ok(Ok(Some(line))) => Some(Frame::parse(&line).expect("bad frame")),
            _ => None,
        }
    }
}

/// What a fake daemon answers for one request.
pub enum Reply {
    Body(Value),
    Error(i64, String),
    Delayed(Duration, Value),
    Silent,
}

pub struct FakeDaemon {
    /// Requests the daemon has received, in arrival order.
    pub requests: mpsc::UnboundedReceiver<Request>,
    /// Raw outbound feed, for daemon-originated frames (`tcprecv`).
    pub outgoing: mpsc::UnboundedSender<String>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl FakeDaemon {
    /// Connect, authenticate as `node`, register, and serve `handler`.
    pub async fn spawn<H>(addr: &str, node: &str, handler: H) -> Self
    where
        H: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let stream = TcpStream::connect(addr).await.expect("daemon connect");
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let token = issue(node, TokenKind::Daemon, 3600, KEY).expect("daemon token");
        let auth = serial_call(
            &mut reader,
            &mut writer,
            "auth",
            json!({ "token": token }),
            MAX_FRAME_DAEMON,
        )
        .await
        .expect("daemon auth");
        assert_eq!(auth.code, 0);

        let outgoing = spawn_writer(writer);
        let register = Request::new(uuid_ticket(), "daemon", json!({}));
        outgoing.send(register.to_line()).expect("register");

        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let loop_outgoing = outgoing.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let line = match read_frame_line(&mut reader, MAX_FRAME_DAEMON).await {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let Ok(Frame::Request(request)) = Frame::parse(&line) else {
                    continue;
                };
                let _ = record_tx.send(request.clone());
                match handler(&request) {
                    Reply::Body(body) => {
                        let _ = loop_outgoing.send(Response::ok(request.ticket, body).to_line());
                    }
                    Reply::Error(code, msg) => {
                        let mut fields = serde_json::Map::new();
                        fields.insert("msg".into(), Value::String(msg));
                        let response = Response {
                            ticket: request.ticket,
                            code,
                            fields,
                        };
                        let _ = loop_outgoing.send(response.to_line());
                    }
                    Reply::Delayed(delay, body) => {
                        let outgoing = loop_outgoing.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = outgoing.send(Response::ok(request.ticket, body).to_line());
                        });
                    }
                    Reply::Silent => {}
                }
            }
        });

        // Let the registration land before the test broadcasts.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            requests: record_rx,
            outgoing,
            reader_task,
        }
    }

    /// Next recorded request, bounded.
    pub async fn next_request(&mut self) -> Request {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no request arrived")
            .expect("daemon loop ended")
    }

    /// Tear the daemon's connection down.
    pub fn close(self) {
        self.reader_task.abort();
    }
}

pub fn uuid_ticket() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A plain `node_info` handler for daemons with the given free GPUs
/// and container names.
pub fn node_info_handler(
    free: Vec<u32>,
    names: Vec<&'static str>,
) -> impl Fn(&Request) -> Reply + Send + Sync + 'static {
    move |request: &Request| match request.cmd.as_str() {
        "node_info" => Reply::Body(json!({
            "free_gpu_ids": free,
            "names": names,
            "ids": [],
        })),
        "run_container" => Reply::Body(json!({ "short_id": "abcdef123456" })),
        _ => Reply::Error(-1, format!("unhandled {}", request.cmd)),
    }
}
