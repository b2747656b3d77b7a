//! Caller-side request multiplexing.
//!
//! [`AsyncClient`] lets any task issue a request over a shared
//! connection and await the matching response by ticket, while other
//! tasks do the same concurrently. The connection's reader loop feeds
//! inbound response frames back through [`AsyncClient::resolve`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::CorralError;
use crate::protocol::{Request, Response};

pub struct AsyncClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl AsyncClient {
    /// Wrap the outgoing half of a connection.
    pub fn new(outgoing: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outgoing,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send `cmd` with `args` and await the response with the same
    /// ticket. Fails with a wrapped daemon error if the connection goes
    /// away before the response arrives.
    pub async fn issue(&self, cmd: &str, args: Value) -> Result<Response, CorralError> {
        let ticket = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(ticket.clone(), tx);

        let request = Request::new(ticket.clone(), cmd, args);
        if self.outgoing.send(request.to_line()).is_err() {
            self.pending
                .lock()
                .expect("pending table poisoned")
                .remove(&ticket);
            return Err(connection_lost());
        }

        match rx.await {
            Ok(response) => Ok(response),
            // Sender dropped: the connection closed with the request
            // outstanding.
            Err(_) => Err(connection_lost()),
        }
    }

    /// Route an inbound response to its waiting ticket. Returns `false`
    /// if no request is outstanding under that ticket.
    pub fn resolve(&self, response: Response) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(&response.ticket);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every outstanding ticket; their issuers observe a
    /// connection-lost daemon error.
    pub fn abort_all(&self) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .clear();
    }

    /// Number of requests still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }
}

fn connection_lost() -> CorralError {
    CorralError::Daemon {
        code: -1,
        msg: "daemon connection lost".into(),
    }
}
