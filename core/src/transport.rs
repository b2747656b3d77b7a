//! NDJSON transport helpers.
//!
//! One JSON frame per line over a persistent TCP stream. Oversized or
//! malformed lines are transport errors: the offending connection is
//! torn down, never answered. Frame size caps differ by role — the
//! central accepts larger frames than daemons and clients do.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{Frame, FrameError, Request, Response};

/// Frame size cap on the central's listener.
pub const MAX_FRAME_CENTRAL: usize = 32 * 1024 * 1024;

/// Frame size cap on daemon and client connections.
pub const MAX_FRAME_DAEMON: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds {limit} byte limit ({got} bytes)")]
    Oversize { limit: usize, got: usize },

    #[error("connection closed")]
    Closed,

    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),

    #[error("response ticket mismatch: expected {expected}, got {got}")]
    TicketMismatch { expected: String, got: String },
}

/// Read one line; `Ok(None)` on a clean EOF, an error on oversize.
pub async fn read_frame_line<R>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<String>, TransportError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > limit {
            return Err(TransportError::Oversize {
                limit,
                got: trimmed.len(),
            });
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Write one frame line, newline-terminated, flushed.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Spawn the writer task for a connection and hand back its feed.
///
/// All outbound frames for one connection funnel through a single
/// channel so concurrent handlers never interleave partial lines. The
/// task exits when every sender is dropped or the peer goes away.
pub fn spawn_writer<W>(mut writer: W) -> mpsc::UnboundedSender<String>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(err) = write_line(&mut writer, &line).await {
                debug!("writer task ended: {err}");
                break;
            }
        }
    });
    tx
}

/// One blocking request/response exchange on an otherwise quiet
/// connection. Used during connection setup (auth, registration)
/// before the multiplexed reader loop takes over.
pub async fn serial_call<R, W>(
    reader: &mut R,
    writer: &mut W,
    cmd: &str,
    args: Value,
    limit: usize,
) -> Result<Response, TransportError>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    let ticket = Uuid::new_v4().to_string();
    let request = Request::new(ticket.clone(), cmd, args);
    write_line(writer, &request.to_line()).await?;

    let line = read_frame_line(reader, limit)
        .await?
        .ok_or(TransportError::Closed)?;
    match Frame::parse(&line)? {
        Frame::Response(response) if response.ticket == ticket => Ok(response),
        frame => Err(TransportError::TicketMismatch {
            expected: ticket,
            got: frame.ticket().to_string(),
        }),
    }
}
