// src/server/listener.rs

//! The accept loop of one listener: hand each connection to an Active
//! worker, which adopts the socket on its own runtime and spawns the
//! session there. Sessions never migrate afterwards.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::context::BoundListener;
use crate::core::session::Session;
use crate::core::worker::{WorkerMessage, WorkerPool};
use crate::server::AnyStream;

/// Runs one listener until shutdown.
pub async fn run_listener(
    bound: BoundListener,
    workers: Arc<WorkerPool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let name = bound.name;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!(listener = %name, "listener stopping");
                return;
            }
            accepted = bound.listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(listener = %name, "accept failed: {e}");
                        continue;
                    }
                };
                debug!(listener = %name, %remote, "accepted connection");
                let Some((worker_id, sender)) = workers.assign() else {
                    warn!(listener = %name, "no active worker, dropping connection");
                    continue;
                };

                // Move the socket off this runtime so the worker's own
                // reactor drives it.
                let std_socket = match socket.into_std() {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!(listener = %name, "socket handoff failed: {e}");
                        continue;
                    }
                };
                let session_config = bound.session_config.clone();
                let task = WorkerMessage::Task(Box::new(move || {
                    match tokio::net::TcpStream::from_std(std_socket) {
                        Ok(stream) => {
                            stream.set_nodelay(true).ok();
                            tokio::task::spawn_local(async move {
                                let result =
                                    Session::run(AnyStream::Tcp(stream), remote, session_config)
                                        .await;
                                if let Err(e) = result
                                    && !e.is_hangup()
                                {
                                    debug!(%remote, "session ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("failed to adopt client socket: {e}"),
                    }
                }));
                if let Err((_, _)) = sender.post(task) {
                    warn!(listener = %name, worker = worker_id, "worker inbox full, dropping connection");
                }
            }
        }
    }
}
