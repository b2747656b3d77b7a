mod bookkeep;
mod exit_store;
mod followers;
mod inventory;
mod link;
mod node;
mod ops;
mod runtime;
mod tunnel;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use corral_core::config::Config;

use crate::node::Node;
use crate::runtime::DockerRuntime;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reconnect backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_RESET: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(900);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::load()?;
    let runtime = Arc::new(DockerRuntime::connect()?);
    let node = Arc::new(Node::new(cfg, hostname()?, runtime));
    info!(
        "corral-agent {} on {} with {} GPUs",
        VERSION, node.hostname, node.gpu_count
    );

    let shutdown = setup_shutdown_signal();
    tokio::spawn(bookkeep::run(node.clone(), shutdown.child_token()));
    tokio::spawn(bookkeep::cleanup_loop(node.clone(), shutdown.child_token()));

    // The daemon dials out; the central never calls us. Reconnect with
    // exponential backoff, resetting after any connection that clearly
    // outlived the current backoff.
    let mut back = BACKOFF_START;
    while !shutdown.is_cancelled() {
        let started = Instant::now();
        match link::one_pass(node.clone()).await {
            Ok(()) => warn!("connection to central closed"),
            Err(err) => warn!("connection to central lost: {err:#}"),
        }
        let lived = started.elapsed();
        if lived > back + Duration::from_secs(5) && back > BACKOFF_RESET {
            back = BACKOFF_RESET;
        }
        info!("reconnecting in {}s", back.as_secs());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(back) => {}
        }
        back = (back * 2).min(BACKOFF_CAP);
    }
    Ok(())
}

fn hostname() -> anyhow::Result<String> {
    #[cfg(unix)]
    {
        Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
    }
    #[cfg(not(unix))]
    {
        Ok(std::env::var("COMPUTERNAME").unwrap_or_else(|_| "node".to_string()))
    }
}

/// Trigger the returned token on SIGINT or SIGTERM.
fn setup_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, shutting down");
        }

        token_clone.cancel();
    });

    token
}
