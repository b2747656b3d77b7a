//! Bookkeeping loops.
//!
//! Every 10 s: scan the runtime, snapshot exited containers into the
//! exit store (then remove them), and stop containers past their
//! timeout (kill on stop failure). Daily at 04:00 local: prune unused
//! runtime objects and expire old exit-store entries.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::exit_store::{ExitEntry, LOG_SNAPSHOT_LIMIT};
use crate::node::{Managed, Node};
use crate::runtime::ContainerStatus;

pub const BOOKKEEP_INTERVAL: Duration = Duration::from_secs(10);

/// One pass of the 10-second loop. Runs serially; state mutation is
/// confined to one pass at a time.
pub async fn bookkeep_pass(node: &Node) {
    let managed = match node.scan().await {
        Ok(managed) => managed,
        Err(err) => {
            warn!("bookkeep scan failed: {err}");
            return;
        }
    };

    let now = Utc::now();
    for m in managed {
        if m.summary.status == ContainerStatus::Exited {
            finalize(node, &m).await;
        } else if timed_out(&m, now) {
            expire(node, &m).await;
        }
    }

    node.followers.prune();
    node.tunnels.sweep();
}

/// Snapshot logs and metadata, then drop the runtime container.
async fn finalize(node: &Node, m: &Managed) {
    let logs = match node.runtime.logs(&m.summary.id, LOG_SNAPSHOT_LIMIT).await {
        Ok(logs) => logs,
        Err(err) => {
            warn!(name = %m.summary.name, "log snapshot failed: {err}");
            Vec::new()
        }
    };
    node.exit_store.lock().expect("exit store poisoned").insert(
        m.summary.short_id.clone(),
        ExitEntry {
            logs,
            name: m.summary.name.clone(),
            user: m.info.user.clone(),
            entry_created_at: SystemTime::now(),
        },
    );
    if let Err(err) = node.runtime.remove(&m.summary.id, false).await {
        warn!(name = %m.summary.name, "removal of exited container failed: {err}");
    } else {
        info!(name = %m.summary.name, short_id = %m.summary.short_id, "container finalized");
    }
}

fn timed_out(m: &Managed, now: DateTime<Utc>) -> bool {
    let Some(created) = m.summary.created_at else {
        return false;
    };
    now.signed_duration_since(created).num_seconds() > m.info.timeout as i64
}

async fn expire(node: &Node, m: &Managed) {
    info!(name = %m.summary.name, timeout = m.info.timeout, "container exceeded timeout");
    if let Err(err) = node.stop_managed(m).await {
        warn!(name = %m.summary.name, "timeout stop failed, killing: {err}");
        if let Err(err) = node.kill_managed(m).await {
            warn!(name = %m.summary.name, "timeout kill failed: {err}");
        }
    }
}

/// The 10-second loop.
pub async fn run(node: Arc<Node>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(BOOKKEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => bookkeep_pass(&node).await,
        }
    }
}

/// The daily 04:00 cleanup loop.
pub async fn cleanup_loop(node: Arc<Node>, shutdown: CancellationToken) {
    loop {
        let delay = until_next_cleanup(chrono::Local::now().time());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => cleanup_pass(&node).await,
        }
    }
}

async fn cleanup_pass(node: &Node) {
    info!("performing clean-up");
    if let Err(err) = node.runtime.prune().await {
        warn!("runtime prune failed: {err}");
    }
    node.exit_store
        .lock()
        .expect("exit store poisoned")
        .prune(SystemTime::now());
}

/// Seconds until the next 04:00 local, never less than one second.
fn until_next_cleanup(now: chrono::NaiveTime) -> Duration {
    let current = f64::from(now.hour()) + f64::from(now.minute()) / 60.0;
    let mut dt = (4.0 - current) * 3600.0;
    while dt < 1.0 {
        dt += 86_400.0;
    }
    Duration::from_secs_f64(dt)
}
