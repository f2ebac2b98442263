// src/core/state.rs

//! Process-wide registry of servers, services, filters and sessions.
//!
//! The registry replaces the global singletons of older proxies: it is an
//! explicit handle passed into components at construction. It also exposes
//! the structured admin hooks (list/show/alter) that an external admin
//! surface renders; mutations to server status flow through the same
//! SharedData channel the monitor publishes on, so routers never see a
//! half-applied change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tracing::info;

use crate::config::ServiceConfig;
use crate::core::filter::FilterModule;
use crate::core::monitor::{ClusterSnapshot, ClusterUpdate, ServerStatusFlags};
use crate::core::shared::SharedData;
use crate::core::worker::{WorkerId, WorkerMessage, WorkerPool};
use crate::core::SqlGateError;

/// A configured backend server. Live counters only; monitored status lives
/// in the cluster snapshot.
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: u16,
    connections: AtomicU64,
    total_connections: AtomicU64,
    /// EWMA of response latency in microseconds, for adaptive routing.
    response_time_us: AtomicU64,
}

impl Server {
    pub fn new(name: String, address: String, port: u16) -> Self {
        Server {
            name,
            address,
            port,
            connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            response_time_us: AtomicU64::new(0),
        }
    }

    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Folds one observed response time into the EWMA with the given
    /// smoothing factor in [0, 1].
    pub fn track_latency(&self, latency: Duration, smoothing: f64) {
        let observed = latency.as_micros() as u64;
        let old = self.response_time_us.load(Ordering::Relaxed);
        let new = if old == 0 {
            observed
        } else {
            ((old as f64) * (1.0 - smoothing) + (observed as f64) * smoothing) as u64
        };
        self.response_time_us.store(new, Ordering::Relaxed);
    }

    pub fn avg_latency(&self) -> Duration {
        Duration::from_micros(self.response_time_us.load(Ordering::Relaxed))
    }
}

/// A named combination of router, filters and servers.
pub struct Service {
    pub name: String,
    pub config: ServiceConfig,
    pub servers: Vec<Arc<Server>>,
    pub filters: Vec<Arc<dyn FilterModule>>,
}

/// A configured listener with its hot-reloadable TLS slot.
pub struct ListenerRuntime {
    pub config: crate::config::ListenerConfig,
    pub tls_slot: Arc<arc_swap::ArcSwapOption<tokio_rustls::TlsAcceptor>>,
}

/// Registry-visible facts about a live session.
#[derive(Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub worker: WorkerId,
    pub user: String,
    pub remote: String,
    pub service: String,
    pub started: Instant,
}

/// The process-wide registry.
pub struct Registry {
    pub servers: DashMap<String, Arc<Server>>,
    pub services: DashMap<String, Arc<Service>>,
    pub filters: DashMap<String, Arc<dyn FilterModule>>,
    pub listeners: DashMap<String, ListenerRuntime>,
    pub sessions: DashMap<u64, SessionInfo>,
    workers: OnceCell<Arc<WorkerPool>>,
    /// The registry's own view/producer slot on the status channel: admin
    /// mutations submit updates here, reads see the latest snapshot.
    status: OnceCell<Arc<SharedData<ClusterSnapshot, ClusterUpdate>>>,
    /// Handle for rate-limited on-demand user cache refreshes.
    user_refresh: OnceCell<crate::core::users::RefreshHandle>,
    next_session_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            servers: DashMap::new(),
            services: DashMap::new(),
            filters: DashMap::new(),
            listeners: DashMap::new(),
            sessions: DashMap::new(),
            workers: OnceCell::new(),
            status: OnceCell::new(),
            user_refresh: OnceCell::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn set_workers(&self, pool: Arc<WorkerPool>) {
        let _ = self.workers.set(pool);
    }

    pub fn workers(&self) -> Option<&Arc<WorkerPool>> {
        self.workers.get()
    }

    pub fn set_status_channel(&self, slot: Arc<SharedData<ClusterSnapshot, ClusterUpdate>>) {
        let _ = self.status.set(slot);
    }

    pub fn set_user_refresh(&self, handle: crate::core::users::RefreshHandle) {
        let _ = self.user_refresh.set(handle);
    }

    /// Nudges the user cache refresher after a lookup miss; silently
    /// dropped when rate-limited.
    pub fn request_user_refresh(&self) {
        if let Some(handle) = self.user_refresh.get() {
            handle.request();
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The latest consistent cluster snapshot.
    pub fn cluster_snapshot(&self) -> Arc<ClusterSnapshot> {
        self.status
            .get()
            .map(|s| s.reader_ready())
            .unwrap_or_default()
    }

    pub fn server(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).map(|s| s.clone())
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|s| s.clone())
    }

    // --- session registry ---

    pub fn register_session(&self, info: SessionInfo) {
        self.sessions.insert(info.id, info);
    }

    pub fn unregister_session(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// Posts an in-worker close to the worker owning the session.
    pub fn kill_session(&self, id: u64) -> Result<(), SqlGateError> {
        let info = self
            .sessions
            .get(&id)
            .ok_or_else(|| SqlGateError::Internal(format!("no session {id}")))?;
        let worker = info.worker;
        drop(info);
        let pool = self
            .workers
            .get()
            .ok_or_else(|| SqlGateError::Internal("worker pool not started".into()))?;
        pool.post_to(worker, WorkerMessage::KillSession(id))
    }

    /// Broadcasts a kill for every session of the user to all workers.
    pub fn kill_user(&self, user: &str) {
        if let Some(pool) = self.workers.get() {
            let user = user.to_string();
            pool.broadcast(|| WorkerMessage::KillUser(user.clone()));
        }
    }

    // --- admin hooks (consumer contract) ---

    pub fn list_servers(&self) -> Value {
        let snapshot = self.cluster_snapshot();
        let servers: Vec<Value> = self
            .servers
            .iter()
            .map(|entry| {
                let server = entry.value();
                let state = snapshot.status_of(&server.name);
                json!({
                    "name": server.name,
                    "address": server.address,
                    "port": server.port,
                    "state": format!("{state:?}"),
                    "connections": server.connections(),
                    "avg_latency_us": server.avg_latency().as_micros() as u64,
                })
            })
            .collect();
        json!({ "servers": servers })
    }

    pub fn show_server(&self, name: &str) -> Option<Value> {
        let server = self.server(name)?;
        let snapshot = self.cluster_snapshot();
        let detail = snapshot.servers.get(name);
        Some(json!({
            "name": server.name,
            "address": server.address,
            "port": server.port,
            "connections": server.connections(),
            "monitor": detail.map(|d| json!({
                "state": format!("{:?}", d.flags),
                "server_id": d.server_id,
                "master_group": d.master_group,
                "replication_lag": d.replication_lag,
                "gtid_current_pos": d.gtid_current_pos,
                "slave_connections": d.slave_connections.len(),
            })),
        }))
    }

    pub fn list_services(&self) -> Value {
        let services: Vec<Value> = self
            .services
            .iter()
            .map(|entry| {
                let service = entry.value();
                json!({
                    "name": service.name,
                    "router": service.config.router,
                    "servers": service.servers.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
                    "filters": service.filters.iter().map(|f| f.name().to_string()).collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({ "services": services })
    }

    pub fn list_filters(&self) -> Value {
        let filters: Vec<Value> = self
            .filters
            .iter()
            .map(|entry| {
                json!({
                    "name": entry.key(),
                    "diagnostics": entry.value().diagnostics(),
                })
            })
            .collect();
        json!({ "filters": filters })
    }

    pub fn show_session(&self, id: u64) -> Option<Value> {
        let info = self.sessions.get(&id)?;
        Some(json!({
            "id": info.id,
            "worker": info.worker,
            "user": info.user,
            "remote": info.remote,
            "service": info.service,
            "age_secs": info.started.elapsed().as_secs(),
        }))
    }

    pub fn list_threads(&self) -> Value {
        let threads: Vec<Value> = self
            .workers
            .get()
            .map(|pool| {
                pool.describe()
                    .into_iter()
                    .map(|(id, state, sessions)| {
                        json!({ "id": id, "state": state.to_string(), "sessions": sessions })
                    })
                    .collect()
            })
            .unwrap_or_default();
        json!({ "threads": threads })
    }

    pub fn show_thread(&self, id: WorkerId) -> Option<Value> {
        self.workers.get().and_then(|pool| {
            pool.describe()
                .into_iter()
                .find(|(wid, _, _)| *wid == id)
                .map(|(id, state, sessions)| {
                    json!({ "id": id, "state": state.to_string(), "sessions": sessions })
                })
        })
    }

    /// `set server X maintenance|drain` / `clear server X ...`: submits a
    /// flag change through the status channel so every worker observes a
    /// consistent snapshot.
    pub fn set_server_flags(
        &self,
        name: &str,
        set: ServerStatusFlags,
        clear: ServerStatusFlags,
    ) -> Result<(), SqlGateError> {
        let slot = self
            .status
            .get()
            .ok_or_else(|| SqlGateError::Internal("status channel not started".into()))?;
        let snapshot = slot.reader_ready();
        let mut server = snapshot
            .servers
            .get(name)
            .cloned()
            .ok_or_else(|| SqlGateError::Config(format!("no server '{name}'")))?;
        server.flags = (server.flags | set) - clear;
        info!(server = name, ?set, ?clear, "admin changed server flags");
        slot.send_update(ClusterUpdate::Server(name.to_string(), server));
        Ok(())
    }

    /// Runtime worker resize, per the documented draining semantics.
    pub fn resize_workers(&self, target: usize) -> Result<(), SqlGateError> {
        let pool = self
            .workers
            .get()
            .ok_or_else(|| SqlGateError::Internal("worker pool not started".into()))?;
        info!(target, "resizing worker pool");
        pool.resize(target)
    }
}
