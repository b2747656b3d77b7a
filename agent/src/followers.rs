//! Streaming log followers.
//!
//! `follow_logs` registers a cursor over a container's log stream;
//! `poll_logs` drains it in bounded batches (1 MiB or 1 s, whichever
//! comes first). Followers nobody polls are garbage-collected by the
//! bookkeep loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use corral_core::error::CorralError;

/// Upper bound on one poll batch.
pub const POLL_BATCH_LIMIT: usize = 1024 * 1024;

/// How long a poll waits for data before returning empty.
pub const POLL_WAIT: Duration = Duration::from_secs(1);

/// Followers idle longer than this are dropped.
pub const FOLLOWER_IDLE: Duration = Duration::from_secs(300);

/// Buffered-but-unpolled bytes are capped; the oldest are dropped
/// first, like a tail.
const BUFFER_CAP: usize = 8 * 1024 * 1024;

struct Follower {
    buffer: Mutex<Vec<u8>>,
    notify: Notify,
    done: AtomicBool,
    last_poll: Mutex<Instant>,
}

impl Follower {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            notify: Notify::new(),
            done: AtomicBool::new(false),
            last_poll: Mutex::new(Instant::now()),
        }
    }

    fn push(&self, chunk: &[u8]) {
        let mut buffer = self.buffer.lock().expect("follower buffer poisoned");
        buffer.extend_from_slice(chunk);
        if buffer.len() > BUFFER_CAP {
            let excess = buffer.len() - BUFFER_CAP;
            buffer.drain(..excess);
        }
        drop(buffer);
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn drain(&self, limit: usize) -> Vec<u8> {
        let mut buffer = self.buffer.lock().expect("follower buffer poisoned");
        let take = buffer.len().min(limit);
        buffer.drain(..take).collect()
    }
}

#[derive(Default)]
pub struct FollowerRegistry {
    followers: Mutex<HashMap<String, Arc<Follower>>>,
}

impl FollowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live follower fed by `stream`; returns its id.
    pub fn register(&self, mut stream: BoxStream<'static, Vec<u8>>) -> String {
        let id = Uuid::new_v4().to_string();
        let follower = Arc::new(Follower::new());
        self.followers
            .lock()
            .expect("follower registry poisoned")
            .insert(id.clone(), follower.clone());

        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                follower.push(&chunk);
            }
            follower.finish();
        });
        id
    }

    /// Register a follower over a fixed snapshot (finalized container).
    pub fn register_static(&self, snapshot: Vec<u8>) -> String {
        let id = Uuid::new_v4().to_string();
        let follower = Arc::new(Follower::new());
        follower.push(&snapshot);
        follower.finish();
        self.followers
            .lock()
            .expect("follower registry poisoned")
            .insert(id.clone(), follower);
        id
    }

    /// Next batch of log bytes plus an EOF marker. Waits up to
    /// [`POLL_WAIT`] when no data is buffered.
    pub async fn poll(&self, id: &str) -> Result<(Vec<u8>, bool), CorralError> {
        let follower = self
            .followers
            .lock()
            .expect("follower registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CorralError::BadRequest(format!("unknown follower `{id}`")))?;

        *follower.last_poll.lock().expect("follower clock poisoned") = Instant::now();

        let deadline = Instant::now() + POLL_WAIT;
        loop {
            let notified = follower.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let batch = follower.drain(POLL_BATCH_LIMIT);
            if !batch.is_empty() {
                return Ok((batch, false));
            }
            if follower.done.load(Ordering::Acquire) {
                self.followers
                    .lock()
                    .expect("follower registry poisoned")
                    .remove(id);
                return Ok((Vec::new(), true));
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok((Vec::new(), false));
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok((Vec::new(), false));
            }
        }
    }

    /// Drop followers idle past [`FOLLOWER_IDLE`].
    pub fn prune(&self) {
        let now = Instant::now();
        self.followers
            .lock()
            .expect("follower registry poisoned")
            .retain(|_, follower| {
                let last = *follower.last_poll.lock().expect("follower clock poisoned");
                now.duration_since(last) < FOLLOWER_IDLE
            });
    }

    pub fn len(&self) -> usize {
        self.followers
            .lock()
            .expect("follower registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
