// src/server/mod.rs

//! Server bootstrap and the main accept/shutdown loop.

pub mod context;
pub mod listener;
pub mod stream;

pub use stream::AnyStream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{reload, EnvFilter, Registry as SubscriberRegistry};

use crate::config::Config;
use crate::core::shared;

/// Handle for runtime log-level changes, owned by the admin surface.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, SubscriberRegistry>>;

/// Waits for a shutdown signal. On Unix, SIGINT and SIGTERM; elsewhere,
/// Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGINT handler: {e}");
                return std::future::pending().await;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return std::future::pending().await;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, initiating graceful shutdown");
        }
    }
}

/// Brings the proxy up and runs it until a shutdown signal arrives; then
/// drains sessions up to the configured grace and tears everything down.
pub async fn run(config: Config, _log_reload: LogReloadHandle) -> Result<()> {
    let grace = config.shutdown_grace;
    let mut ctx = context::build(config).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut listener_tasks = JoinSet::new();
    for bound in ctx.listeners.drain(..) {
        listener_tasks.spawn(listener::run_listener(
            bound,
            ctx.workers.clone(),
            shutdown_tx.subscribe(),
        ));
    }
    info!(
        workers = ctx.workers.active_count(),
        "sqlgate is ready to accept connections"
    );

    await_shutdown_signal().await;

    // Stop accepting, wake collectors, drain sessions up to the grace.
    let _ = shutdown_tx.send(());
    shared::initiate_shutdown();
    listener_tasks.abort_all();

    let deadline = Instant::now() + grace;
    loop {
        let open: usize = ctx.registry.sessions.len();
        if open == 0 {
            break;
        }
        if Instant::now() >= deadline {
            info!(open, "shutdown grace elapsed, force-closing sessions");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    ctx.workers.shutdown();
    for thread in ctx.collector_threads.drain(..) {
        let _ = thread.join();
    }
    info!("shutdown complete");
    Ok(())
}
