//! Archive of finalized containers.
//!
//! When a managed container exits, bookkeeping snapshots its logs and
//! metadata here before removing the runtime container. Entries expire
//! seven days after insertion; until then, clients can still fetch logs
//! and see the container listed as `finalized`.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Log snapshots keep at most the last 8 MiB.
pub const LOG_SNAPSHOT_LIMIT: usize = 8 * 1024 * 1024;

/// Entries live for seven days.
pub const RETENTION: Duration = Duration::from_secs(7 * 86_400);

#[derive(Debug, Clone)]
pub struct ExitEntry {
    pub logs: Vec<u8>,
    pub name: String,
    pub user: String,
    pub entry_created_at: SystemTime,
}

#[derive(Default)]
pub struct ExitStore {
    entries: HashMap<String, ExitEntry>,
}

impl ExitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, short_id: String, mut entry: ExitEntry) {
        if entry.logs.len() > LOG_SNAPSHOT_LIMIT {
            entry.logs.drain(..entry.logs.len() - LOG_SNAPSHOT_LIMIT);
        }
        self.entries.insert(short_id, entry);
    }

    pub fn get(&self, short_id: &str) -> Option<&ExitEntry> {
        self.entries.get(short_id)
    }

    pub fn remove(&mut self, short_id: &str) -> Option<ExitEntry> {
        self.entries.remove(short_id)
    }

    pub fn contains(&self, short_id: &str) -> bool {
        self.entries.contains_key(short_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExitEntry)> {
        self.entries.iter()
    }

    /// Drop entries older than [`RETENTION`].
    pub fn prune(&mut self, now: SystemTime) {
        self.entries.retain(|_, entry| {
            now.duration_since(entry.entry_created_at)
                .map(|age| age < RETENTION)
                .unwrap_or(true)
        });
    }
}
