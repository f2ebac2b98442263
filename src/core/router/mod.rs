// src/core/router/mod.rs

//! Routers: pick backends per `RouteInfo` and keep session state
//! replayable.
//!
//! The reference router is `readwritesplit`: writes and transactions stick
//! to the master, reads spread over eligible replicas per the configured
//! selection criterion, session commands fan out to every connected
//! backend and are recorded for replay on backends added later. Causal
//! reads hold a replica read until the replica reaches the last observed
//! write GTID, or fall back to the master after a timeout.

pub mod history;
pub mod select;

pub use history::SessionCommandHistory;
pub use select::{select, Candidate, SelectCriteria};

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::buffer::BufChain;
use crate::core::classifier::{LoadDataState, RouteInfo, TargetClass, TypeMask};
use crate::core::protocol::codec;
use crate::core::protocol::constants::error_codes;
use crate::core::protocol::packets::ErrPacket;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::session::auth::BackendAuth;
use crate::core::session::backend::{BackendEndpoint, BackendEvent};
use crate::core::state::Service;
use crate::core::worker::WorkerContext;
use crate::core::SqlGateError;

/// What a backend packet produced for the client.
#[derive(Debug, Default)]
pub struct ReplyDelivery {
    pub to_client: Vec<BufChain>,
    /// The logical reply completed with this packet.
    pub completed: bool,
}

/// Outcome of a backend transport failure.
pub enum ErrorVerdict {
    /// The session survives (spare backend lost, or the read was retried).
    Continue,
    /// The session must die; the packet is the ERR to send first.
    Fail(BufChain),
}

/// Per-session router instance.
#[async_trait(?Send)]
pub trait RouterSession {
    /// Routes one classified client request.
    async fn route_query(&mut self, info: &RouteInfo, packet: BufChain)
        -> Result<(), SqlGateError>;

    /// Consumes one packet from a backend.
    async fn handle_reply(
        &mut self,
        backend: u64,
        packet: BufChain,
    ) -> Result<ReplyDelivery, SqlGateError>;

    /// A backend connection failed.
    async fn handle_backend_error(
        &mut self,
        backend: u64,
        error: SqlGateError,
    ) -> Result<ErrorVerdict, SqlGateError>;

    /// Reply tracker of the backend currently serving the client.
    fn reply_tracker(&self) -> Option<&ReplyTracker>;

    /// The master this session currently resolves to, for switchover
    /// detection.
    fn master_name(&self) -> Option<String>;

    /// Tears down or parks all backend connections.
    async fn close(&mut self);
}

/// Builds the router session a service is configured with.
pub fn make_router_session(
    service: Arc<Service>,
    worker: Rc<WorkerContext>,
    auth: BackendAuth,
    events: mpsc::UnboundedSender<(u64, BackendEvent)>,
) -> Result<Box<dyn RouterSession>, SqlGateError> {
    match service.config.router.as_str() {
        "readwritesplit" => Ok(Box::new(RwSplitSession::new(service, worker, auth, events))),
        other => Err(SqlGateError::Config(format!("unknown router '{other}'"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendMode {
    /// Replaying the session command history before serving.
    ReplayingHistory { pos: usize },
    Ready,
}

struct RwBackend {
    endpoint: BackendEndpoint,
    reply: ReplyTracker,
    mode: BackendMode,
    /// A reply is outstanding on this connection.
    busy: bool,
    /// Collect reply bytes for checksum comparison.
    collecting: bool,
    acc: Vec<u8>,
    sent_at: Option<Instant>,
}

impl RwBackend {
    fn id(&self) -> u64 {
        self.endpoint.id()
    }

    fn server_name(&self) -> &str {
        &self.endpoint.server.name
    }
}

struct SescmdWait {
    history_id: u64,
    /// The backend whose reply is forwarded to the client and defines the
    /// canonical outcome.
    owner: u64,
    pending: Vec<u64>,
}

struct InFlight {
    packet: BufChain,
    retryable_read: bool,
    forwarded: bool,
    retries: u32,
}

/// The readwritesplit router session.
pub struct RwSplitSession {
    service: Arc<Service>,
    worker: Rc<WorkerContext>,
    auth: BackendAuth,
    events: mpsc::UnboundedSender<(u64, BackendEvent)>,
    backends: Vec<RwBackend>,
    /// Backend serving the in-flight client request.
    current: Option<u64>,
    /// Backend whose reply completed most recently; its tracker stays
    /// readable until the next request is dispatched.
    last_served: Option<u64>,
    last_used: Option<u64>,
    trx_target: Option<u64>,
    trx_is_write: bool,
    history: SessionCommandHistory,
    sescmd: Option<SescmdWait>,
    in_flight: Option<InFlight>,
    last_write_gtid: Option<String>,
    round_robin: usize,
}

impl RwSplitSession {
    pub fn new(
        service: Arc<Service>,
        worker: Rc<WorkerContext>,
        auth: BackendAuth,
        events: mpsc::UnboundedSender<(u64, BackendEvent)>,
    ) -> Self {
        let history = SessionCommandHistory::new(service.config.max_sescmd_history);
        RwSplitSession {
            service,
            worker,
            auth,
            events,
            backends: Vec::new(),
            current: None,
            last_served: None,
            last_used: None,
            trx_target: None,
            trx_is_write: false,
            history,
            sescmd: None,
            in_flight: None,
            last_write_gtid: None,
            round_robin: 0,
        }
    }

    fn backend_idx(&self, id: u64) -> Option<usize> {
        self.backends.iter().position(|b| b.id() == id)
    }

    fn snapshot_master(&self) -> Option<String> {
        let snapshot = self.worker.servers.reader_ready();
        snapshot.master().map(|(name, _)| name.to_string())
    }

    /// Finds or opens a connection to the named server. A fresh or pooled
    /// connection first replays the session command history; the returned
    /// flag is false while the replay is still running.
    async fn get_or_connect(&mut self, server_name: &str) -> Result<(u64, bool), SqlGateError> {
        if let Some(backend) = self.backends.iter().find(|b| b.server_name() == server_name) {
            let ready = backend.mode == BackendMode::Ready;
            return Ok((backend.id(), ready));
        }
        let server = self
            .service
            .servers
            .iter()
            .find(|s| s.name == server_name)
            .cloned()
            .ok_or_else(|| {
                SqlGateError::NoBackend(format!("server '{server_name}' not in service"))
            })?;

        let imprint = crate::core::worker::SessionImprint {
            user: self.auth.user.clone(),
            db: self.auth.db.clone(),
            charset: self.auth.charset,
        };
        let endpoint = {
            let pooled = self.worker.pool.borrow_mut().check_out(
                server_name,
                &imprint,
                |e: &BackendEndpoint| !e.is_dead(),
            );
            match pooled {
                Some(endpoint) => {
                    debug!(server = server_name, "reusing pooled backend connection");
                    endpoint.rebind_events(self.events.clone());
                    endpoint
                }
                None => {
                    let connect = BackendEndpoint::connect(
                        server.clone(),
                        &self.auth,
                        &self.worker,
                        self.events.clone(),
                    );
                    tokio::time::timeout(self.service.config.connect_timeout, connect)
                        .await
                        .map_err(|_| {
                            SqlGateError::Timeout(format!("connecting to {server_name}"))
                        })??
                }
            }
        };

        let caps = endpoint.capabilities();
        let mut backend = RwBackend {
            endpoint,
            reply: ReplyTracker::new(caps),
            mode: BackendMode::Ready,
            busy: false,
            collecting: false,
            acc: Vec::new(),
            sent_at: None,
        };

        if !self.history.is_empty() {
            backend.mode = BackendMode::ReplayingHistory { pos: 0 };
            backend.collecting = true;
            let first = self
                .history
                .at(0)
                .map(|c| (c.packet.shallow_clone(), codec::command_of(&c.packet)))
                .ok_or_else(|| SqlGateError::Internal("empty history".into()))?;
            if let Some(cmd) = first.1 {
                backend.reply.start(cmd);
            }
            backend.busy = true;
            backend.endpoint.write_packet(&first.0).await?;
            debug!(
                server = server_name,
                commands = self.history.len(),
                "replaying session command history on new backend"
            );
        }

        let id = backend.id();
        let ready = backend.mode == BackendMode::Ready;
        self.backends.push(backend);
        Ok((id, ready))
    }

    /// Slave candidates under the current snapshot, lag cap and causal
    /// watermark.
    fn slave_candidates(&self, max_rlag: Option<i64>, watermark: Option<&str>) -> Vec<Candidate> {
        let snapshot = self.worker.servers.reader_ready();
        self.service
            .servers
            .iter()
            .filter_map(|server| {
                let state = snapshot.servers.get(&server.name)?;
                if !state.flags.is_slave() {
                    return None;
                }
                if let Some(cap) = max_rlag
                    && (state.replication_lag < 0 || state.replication_lag > cap)
                {
                    return None;
                }
                if let Some(watermark) = watermark
                    && !gtid_reaches(&state.gtid_current_pos, watermark)
                {
                    return None;
                }
                Some(Candidate {
                    server: server.clone(),
                    replication_lag: state.replication_lag,
                })
            })
            .collect()
    }

    /// Picks a slave, waiting out the causal-read watermark if configured;
    /// falls back to the master when no replica qualifies.
    async fn pick_slave(&mut self, info: &RouteInfo) -> Result<String, SqlGateError> {
        let max_rlag = info.max_rlag().or({
            let cap = self.service.config.max_replication_lag;
            (cap >= 0).then_some(cap)
        });
        let watermark = if self.service.config.causal_reads {
            self.last_write_gtid.clone()
        } else {
            None
        };

        let deadline = Instant::now() + self.service.config.causal_reads_timeout;
        loop {
            let candidates = self.slave_candidates(max_rlag, watermark.as_deref());
            if let Some(pick) = select(
                self.service.config.select_criteria,
                &candidates,
                &mut self.round_robin,
            ) {
                return Ok(pick.server.name.clone());
            }
            if watermark.is_none() || Instant::now() >= deadline {
                break;
            }
            // The watermark has not propagated yet; poll the snapshot.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if watermark.is_some() {
            debug!("causal read watermark not reached on any replica, using the master");
        }
        self.master_target()
    }

    fn master_target(&self) -> Result<String, SqlGateError> {
        self.snapshot_master()
            .filter(|name| self.service.servers.iter().any(|s| &s.name == name))
            .ok_or_else(|| SqlGateError::NoBackend("no running master".into()))
    }

    /// Sends a normal (non-session) query to one backend.
    async fn send_to(
        &mut self,
        backend_id: u64,
        info: &RouteInfo,
        packet: BufChain,
    ) -> Result<(), SqlGateError> {
        let idx = self
            .backend_idx(backend_id)
            .ok_or_else(|| SqlGateError::Internal("routing to unknown backend".into()))?;
        // The LOAD DATA statement itself reports no pending response (the
        // client streams first), but the backend does answer once the
        // stream ends, so its reply is armed here all the same.
        let expecting =
            info.expecting_response() || info.load_data_state() == LoadDataState::Active;
        let backend = &mut self.backends[idx];
        if expecting {
            if let Some(cmd) = info.command() {
                backend.reply.start(cmd);
            }
            backend.busy = true;
            backend.sent_at = Some(Instant::now());
            self.current = Some(backend_id);
            self.in_flight = Some(InFlight {
                packet: packet.shallow_clone(),
                retryable_read: self.service.config.retry_failed_reads
                    && info.type_mask().contains(TypeMask::READ)
                    && !info.type_mask().contains(TypeMask::WRITE)
                    && self.trx_target.is_none(),
                forwarded: false,
                retries: 0,
            });
        }
        self.last_used = Some(backend_id);
        backend.endpoint.write_packet(&packet).await?;
        Ok(())
    }

    /// Session command: record, fan out to every connected backend. The
    /// first backend's reply is forwarded and defines the canonical
    /// outcome; commands with no response (STMT_CLOSE, QUIT) only fan out.
    async fn route_session_command(
        &mut self,
        info: &RouteInfo,
        packet: BufChain,
    ) -> Result<(), SqlGateError> {
        let expecting = info.expecting_response();
        if self.backends.is_empty() {
            let master = self.master_target()?;
            let (id, ready) = self.get_or_connect(&master).await?;
            if !ready {
                self.delay_on(id, packet)?;
                return Ok(());
            }
        }
        let history_id = expecting.then(|| self.history.record(&packet));
        let owner = self
            .current_master_backend()
            .or(self.last_used)
            .or_else(|| self.backends.first().map(|b| b.id()))
            .ok_or_else(|| SqlGateError::NoBackend("no backend for session command".into()))?;

        let mut pending = Vec::new();
        for backend in self.backends.iter_mut() {
            if backend.mode != BackendMode::Ready {
                continue;
            }
            if expecting {
                if let Some(cmd) = info.command() {
                    backend.reply.start(cmd);
                }
                backend.busy = true;
                backend.collecting = true;
                backend.acc.clear();
                pending.push(backend.id());
            }
            backend.endpoint.write_packet(&packet).await?;
        }
        if let Some(history_id) = history_id {
            self.current = Some(owner);
            self.sescmd = Some(SescmdWait {
                history_id,
                owner,
                pending,
            });
        }
        Ok(())
    }

    /// Parks a request in the delay queue of a backend that is still
    /// replaying history; it is flushed once the backend reaches Ready.
    fn delay_on(&mut self, backend_id: u64, packet: BufChain) -> Result<(), SqlGateError> {
        let idx = self
            .backend_idx(backend_id)
            .ok_or_else(|| SqlGateError::Internal("delaying on unknown backend".into()))?;
        self.backends[idx].endpoint.delay_packet(packet);
        Ok(())
    }

    fn current_master_backend(&self) -> Option<u64> {
        let master = self.snapshot_master()?;
        self.backends
            .iter()
            .find(|b| b.server_name() == master)
            .map(|b| b.id())
    }

    /// Advances a history replay after one replayed reply completed.
    async fn continue_replay(&mut self, idx: usize) -> Result<Option<u64>, SqlGateError> {
        let verifiable = self.history.verifiable();
        let backend = &mut self.backends[idx];
        let BackendMode::ReplayingHistory { pos } = backend.mode else {
            return Ok(None);
        };
        let checksum = SessionCommandHistory::reply_checksum(&backend.acc);
        backend.acc.clear();
        let expected = self.history.at(pos).and_then(|c| c.checksum);
        if verifiable
            && let Some(expected) = expected
            && expected != checksum
        {
            let id = backend.id();
            let name = backend.server_name().to_string();
            warn!(server = %name, "session command replay diverged, dropping backend");
            return Ok(Some(id));
        }
        let next = pos + 1;
        if let Some(cmd) = self.history.at(next) {
            let packet = cmd.packet.shallow_clone();
            let command = codec::command_of(&packet);
            let backend = &mut self.backends[idx];
            backend.mode = BackendMode::ReplayingHistory { pos: next };
            if let Some(command) = command {
                backend.reply.start(command);
            }
            backend.endpoint.write_packet(&packet).await?;
        } else {
            let backend = &mut self.backends[idx];
            backend.mode = BackendMode::Ready;
            backend.busy = false;
            backend.collecting = false;
            debug!(server = backend.server_name(), "history replay complete");
        }
        Ok(None)
    }

    async fn drop_backend(&mut self, id: u64) {
        if let Some(idx) = self.backend_idx(id) {
            let backend = self.backends.remove(idx);
            backend.endpoint.close().await;
        }
        if self.last_used == Some(id) {
            self.last_used = None;
        }
        if self.trx_target == Some(id) {
            self.trx_target = None;
        }
        if let Some(wait) = &mut self.sescmd {
            wait.pending.retain(|&p| p != id);
        }
    }

    /// Flushes the delay queue of a backend that just finished its history
    /// replay. The session serializes requests, so at most one logical
    /// request waits here.
    async fn flush_delayed(&mut self, backend_id: u64) -> Result<(), SqlGateError> {
        let idx = self
            .backend_idx(backend_id)
            .ok_or_else(|| SqlGateError::Internal("flushing unknown backend".into()))?;
        let backend = &mut self.backends[idx];
        let delayed = std::mem::take(backend.endpoint.descriptor.delay_queue());
        if delayed.is_empty() {
            return Ok(());
        }
        if let Some(cmd) = codec::command_of(&delayed)
            && cmd.will_respond()
        {
            backend.reply.start(cmd);
            backend.busy = true;
            backend.sent_at = Some(Instant::now());
            self.current = Some(backend_id);
        }
        self.last_used = Some(backend_id);
        backend.endpoint.write_packet(&delayed).await?;
        Ok(())
    }

    fn lost_connection_err(&self, detail: &str) -> BufChain {
        let body = ErrPacket::build(
            error_codes::CR_CONN_HOST_ERROR,
            "HY000",
            &format!("Lost connection to backend server: {detail}"),
        );
        codec::build_packet(1, &body)
    }
}

#[async_trait(?Send)]
impl RouterSession for RwSplitSession {
    async fn route_query(
        &mut self,
        info: &RouteInfo,
        packet: BufChain,
    ) -> Result<(), SqlGateError> {
        // Continuations of multi-packet statements and LOAD DATA body
        // packets follow the statement to its backend without arming a new
        // reply. A session command mid-stream follows to every backend it
        // fanned out to, and the recorded history entry grows with it.
        if info.large_query() || info.loading_data() {
            if let Some((history_id, pending)) = self
                .sescmd
                .as_ref()
                .map(|w| (w.history_id, w.pending.clone()))
            {
                self.history.append_continuation(history_id, &packet);
                for id in pending {
                    if let Some(idx) = self.backend_idx(id) {
                        self.backends[idx].endpoint.write_packet(&packet).await?;
                    }
                }
                return Ok(());
            }
            let target = self
                .last_used
                .ok_or_else(|| SqlGateError::RoutingFailed("continuation without a target".into()))?;
            let idx = self
                .backend_idx(target)
                .ok_or_else(|| SqlGateError::RoutingFailed("continuation target gone".into()))?;
            self.backends[idx].endpoint.write_packet(&packet).await?;
            return Ok(());
        }

        let mask = info.type_mask();
        if info.target().contains(TargetClass::ALL) {
            return self.route_session_command(info, packet).await;
        }

        // Transactions stick to the backend they started on.
        let server_name = if let Some(trx) = self.trx_target {
            if mask.contains(TypeMask::WRITE) {
                self.trx_is_write = true;
            }
            self.backend_idx(trx)
                .map(|idx| self.backends[idx].server_name().to_string())
                .ok_or_else(|| SqlGateError::NoBackend("transaction target lost".into()))?
        } else if info.target().contains(TargetClass::NAMED_SERVER)
            && let Some(name) = info.named_target()
        {
            name.to_string()
        } else if info.target().contains(TargetClass::LAST_USED) {
            match self.last_used.and_then(|id| self.backend_idx(id)) {
                Some(idx) => self.backends[idx].server_name().to_string(),
                None => self.master_target()?,
            }
        } else if info.target().contains(TargetClass::SLAVE)
            || info.target().contains(TargetClass::RLAG_MAX)
        {
            self.pick_slave(info).await?
        } else {
            self.master_target()?
        };

        let (backend_id, ready) = self.get_or_connect(&server_name).await?;
        if mask.contains(TypeMask::BEGIN_TRX) {
            self.trx_target = Some(backend_id);
            self.trx_is_write = !info.is_trx_still_read_only();
        } else if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            self.trx_target = None;
            self.trx_is_write = false;
        }
        if !ready {
            self.delay_on(backend_id, packet)?;
            return Ok(());
        }
        self.send_to(backend_id, info, packet).await
    }

    async fn handle_reply(
        &mut self,
        backend: u64,
        packet: BufChain,
    ) -> Result<ReplyDelivery, SqlGateError> {
        let idx = self
            .backend_idx(backend)
            .ok_or_else(|| SqlGateError::Internal("reply from unknown backend".into()))?;
        {
            let b = &mut self.backends[idx];
            if b.collecting {
                b.acc.extend(packet.bytes());
            }
            b.reply.process(&packet)?;
        }
        let complete = self.backends[idx].reply.is_complete();

        // History replay on a fresh backend: nothing reaches the client.
        if matches!(self.backends[idx].mode, BackendMode::ReplayingHistory { .. }) {
            if complete {
                if let Some(diverged) = self.continue_replay(idx).await? {
                    self.drop_backend(diverged).await;
                } else if self.backends[idx].mode == BackendMode::Ready {
                    self.flush_delayed(backend).await?;
                }
            }
            return Ok(ReplyDelivery::default());
        }

        // Session command fan-out.
        if let Some((owner, history_id)) = self
            .sescmd
            .as_ref()
            .filter(|w| w.pending.contains(&backend))
            .map(|w| (w.owner, w.history_id))
        {
            let is_owner = owner == backend;
            if complete {
                let done = match self.sescmd.as_mut() {
                    Some(wait) => {
                        wait.pending.retain(|&p| p != backend);
                        wait.pending.is_empty()
                    }
                    None => true,
                };
                let checksum = {
                    let b = &mut self.backends[idx];
                    b.busy = false;
                    b.collecting = false;
                    let checksum = SessionCommandHistory::reply_checksum(&b.acc);
                    b.acc.clear();
                    checksum
                };
                if is_owner {
                    self.history.set_checksum(history_id, checksum);
                } else if self.history.verifiable() {
                    let expected = self
                        .history
                        .iter()
                        .find(|c| c.id == history_id)
                        .and_then(|c| c.checksum);
                    if let Some(expected) = expected
                        && expected != checksum
                    {
                        let name = self.backends[idx].server_name().to_string();
                        warn!(server = %name, "session command outcome diverged, dropping backend");
                        self.drop_backend(backend).await;
                    }
                }
                if done {
                    self.sescmd = None;
                    self.last_served = Some(owner);
                    self.current = None;
                }
            }
            return Ok(ReplyDelivery {
                to_client: if is_owner { vec![packet] } else { Vec::new() },
                completed: complete && self.sescmd.is_none(),
            });
        }

        // Normal reply from the serving backend.
        if self.current != Some(backend) {
            // Late packet from a dropped conversation; nothing to deliver.
            return Ok(ReplyDelivery::default());
        }
        if complete {
            let b = &mut self.backends[idx];
            b.busy = false;
            if let Some(sent_at) = b.sent_at.take() {
                b.endpoint
                    .server
                    .track_latency(sent_at.elapsed(), self.service.config.latency_smoothing);
            }
            if let Some(gtid) = b.reply.gtid() {
                self.last_write_gtid = Some(gtid.to_string());
            }
            self.last_served = Some(backend);
            self.current = None;
            self.in_flight = None;
        } else if let Some(in_flight) = &mut self.in_flight {
            in_flight.forwarded = true;
        }
        Ok(ReplyDelivery {
            to_client: vec![packet],
            completed: complete,
        })
    }

    async fn handle_backend_error(
        &mut self,
        backend: u64,
        error: SqlGateError,
    ) -> Result<ErrorVerdict, SqlGateError> {
        let name = self
            .backend_idx(backend)
            .map(|idx| self.backends[idx].server_name().to_string())
            .unwrap_or_default();
        let was_current = self.current == Some(backend);
        let was_trx = self.trx_target == Some(backend);
        info!(server = %name, %error, "backend connection failed");
        self.drop_backend(backend).await;

        if !was_current && !was_trx {
            return Ok(ErrorVerdict::Continue);
        }

        if was_trx && self.trx_is_write {
            // Loss of the master during an active write transaction fails
            // the session.
            return Ok(ErrorVerdict::Fail(self.lost_connection_err(&name)));
        }

        if was_current
            && let Some(in_flight) = self.in_flight.take()
            && in_flight.retryable_read
            && !in_flight.forwarded
            && in_flight.retries == 0
        {
            // Transparent replica retry: no reply bytes reached the client.
            let candidates = self.slave_candidates(None, None);
            if let Some(pick) = select(
                self.service.config.select_criteria,
                &candidates,
                &mut self.round_robin,
            ) {
                let server = pick.server.name.clone();
                info!(server = %server, "retrying read on another replica");
                let (id, ready) = self.get_or_connect(&server).await?;
                let packet = in_flight.packet.shallow_clone();
                if ready {
                    let idx = self
                        .backend_idx(id)
                        .ok_or_else(|| SqlGateError::Internal("retry backend missing".into()))?;
                    let b = &mut self.backends[idx];
                    if let Some(cmd) = codec::command_of(&packet) {
                        b.reply.start(cmd);
                    }
                    b.busy = true;
                    b.sent_at = Some(Instant::now());
                    b.endpoint.write_packet(&packet).await?;
                    self.current = Some(id);
                    self.last_used = Some(id);
                } else {
                    self.delay_on(id, packet.shallow_clone())?;
                }
                self.in_flight = Some(InFlight {
                    retries: 1,
                    forwarded: false,
                    retryable_read: true,
                    packet,
                });
                return Ok(ErrorVerdict::Continue);
            }
        }

        self.current = None;
        self.in_flight = None;
        Ok(ErrorVerdict::Fail(self.lost_connection_err(&name)))
    }

    fn reply_tracker(&self) -> Option<&ReplyTracker> {
        let id = self.current.or(self.last_served)?;
        let idx = self.backend_idx(id)?;
        Some(&self.backends[idx].reply)
    }

    fn master_name(&self) -> Option<String> {
        self.snapshot_master()
    }

    async fn close(&mut self) {
        for backend in self.backends.drain(..) {
            let parkable = !backend.busy && !backend.endpoint.is_dead();
            if parkable {
                let imprint = backend.endpoint.imprint();
                let server = backend.endpoint.server.name.clone();
                backend.endpoint.park_events();
                let parked =
                    self.worker
                        .pool
                        .borrow_mut()
                        .park(&server, backend.endpoint, imprint);
                if let Err(endpoint) = parked {
                    endpoint.close().await;
                }
            } else {
                backend.endpoint.close().await;
            }
        }
    }
}

/// Whether the GTID position `current` has reached `watermark`. Positions
/// are `domain-server-sequence`; within the same domain, sequence numbers
/// are compared, otherwise only an exact match counts.
pub fn gtid_reaches(current: &str, watermark: &str) -> bool {
    if current == watermark {
        return true;
    }
    let parse = |gtid: &str| -> Option<(String, u64)> {
        let (head, seq) = gtid.rsplit_once('-')?;
        let (domain, _server) = head.split_once('-')?;
        Some((domain.to_string(), seq.parse().ok()?))
    };
    match (parse(current), parse(watermark)) {
        (Some((da, sa)), Some((db, sb))) => da == db && sa >= sb,
        _ => false,
    }
}
