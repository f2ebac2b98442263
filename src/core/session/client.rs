// src/core/session/client.rs

//! The client-side protocol session and the per-session orchestration.
//!
//! A session owns the client connection, the classifier, the filter chain
//! instance and the router session. The handshake and authentication
//! phases are explicit state machines driven by incoming packets; the
//! command phase is a cooperative loop that pulls at most one complete
//! client packet per turn, pushes it down the filter chain into the
//! router, and relays backend replies back up the chain, preserving order
//! in both directions.

use std::rc::Rc;
use std::sync::Arc;

use bytes::BytesMut;
use strum_macros::Display;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use super::auth::{verify_token, BackendAuth, NATIVE_PLUGIN};
use super::backend::{BackendEvent, PendingConnect, TokenSource};
use super::trackers::{ChangeTracker, SessionChange};
use crate::core::buffer::BufChain;
use crate::core::classifier::{
    ClassifierSettings, HeuristicInspector, LoadDataState, QueryClassifier, TypeMask,
};
use crate::core::filter::{DownstreamAction, FilterCtx, FilterSession};
use crate::core::protocol::codec;
use crate::core::protocol::constants::{error_codes, Capabilities, Command, StatusFlags};
use crate::core::protocol::packets::{
    default_scramble, ChangeUser, ErrPacket, Handshake, HandshakeResponse, OkPacket,
};
use crate::core::protocol::proxy_header::{self, AllowedNetworks, PreParseResult};
use crate::core::protocol::reply::ReplyTracker;
use crate::core::router::{make_router_session, ErrorVerdict, RouterSession};
use crate::core::state::{Registry, Service, SessionInfo};
use crate::core::users::LookupError;
use crate::core::worker::{DcbRole, Descriptor, SessionHandle, WorkerContext};
use crate::core::SqlGateError;
use crate::server::AnyStream;

/// Overall phase of the client session.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Handshaking,
    Authenticating,
    Ready,
    ChangingUser,
    Quit,
    Failed,
}

/// Handshake sub-machine.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum HsState {
    Init,
    ExpectProxyHdr,
    ExpectSslReq,
    SslNeg,
    ExpectHsResp,
    Complete,
    Fail,
}

/// Authentication sub-machine.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    FindEntry,
    TryAgain,
    StartExchange,
    ContinueExchange,
    CheckToken,
    StartSession,
    WaitForBackend,
    ChangeUserOk,
    NoPlugin,
    Complete,
    Fail,
}

/// Listener-derived settings a session is created with.
#[derive(Clone)]
pub struct SessionConfig {
    pub service: Arc<Service>,
    pub registry: Arc<Registry>,
    pub server_version: String,
    pub proxy_networks: Option<AllowedNetworks>,
    /// Relay client credentials to the master and let its reply decide.
    pub passthrough_auth: bool,
    /// Hot-reloadable TLS material; `reload tls` swaps the acceptor.
    pub tls: Arc<arc_swap::ArcSwapOption<tokio_rustls::TlsAcceptor>>,
    pub low_water: usize,
    pub high_water: usize,
}

/// Capabilities the proxy itself is willing to speak with clients.
fn advertised_caps(tls: bool) -> Capabilities {
    let mut caps = Capabilities::PROTOCOL_41
        | Capabilities::SECURE_CONNECTION
        | Capabilities::PLUGIN_AUTH
        | Capabilities::PLUGIN_AUTH_LENENC
        | Capabilities::CONNECT_WITH_DB
        | Capabilities::CONNECT_ATTRS
        | Capabilities::LOCAL_FILES
        | Capabilities::MULTI_RESULTS
        | Capabilities::PS_MULTI_RESULTS
        | Capabilities::TRANSACTIONS
        | Capabilities::SESSION_TRACK;
    if tls {
        caps |= Capabilities::SSL;
    }
    caps
}

/// One client session.
pub struct Session {
    id: u64,
    worker: Rc<WorkerContext>,
    config: SessionConfig,
    descriptor: Descriptor,
    phase: SessionPhase,
    hs_state: HsState,
    auth_state: AuthState,
    scramble: Vec<u8>,
    client_caps: Capabilities,
    auth: BackendAuth,

    classifier: QueryClassifier,
    filters: Vec<Box<dyn FilterSession>>,
    filter_ctx: FilterCtx,
    router: Box<dyn RouterSession>,
    change: ChangeTracker,
    change_user_backup: Option<BackendAuth>,
    remembered_master: Option<String>,

    /// A reply toward the client is outstanding.
    busy: bool,
    /// Deadline for the outstanding reply, when query timeouts are on.
    busy_deadline: Option<tokio::time::Instant>,
    /// Filter-injected packets waiting for the wire, one reply at a time.
    downstream_queue: std::collections::VecDeque<BufChain>,

    read_half: ReadHalf<AnyStream>,
    write_half: WriteHalf<AnyStream>,
    acc: BufChain,
    backend_events: mpsc::UnboundedReceiver<(u64, BackendEvent)>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Session {
    /// Runs the whole lifecycle of one accepted client connection on the
    /// current worker thread.
    pub async fn run(
        stream: AnyStream,
        remote: std::net::SocketAddr,
        config: SessionConfig,
    ) -> Result<(), SqlGateError> {
        let worker = crate::core::worker::context();
        let id = config.registry.next_session_id();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mut session = match Session::handshake(stream, remote, config, worker, id, shutdown_rx)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                debug!(session = id, "session setup failed: {e}");
                return Err(e);
            }
        };

        session.worker.register_session(
            id,
            SessionHandle {
                user: session.auth.user.clone(),
                shutdown_tx,
            },
        );
        session.config.registry.register_session(SessionInfo {
            id,
            worker: session.worker.id,
            user: session.auth.user.clone(),
            remote: remote.to_string(),
            service: session.config.service.name.clone(),
            started: std::time::Instant::now(),
        });

        // Filters with side connections (tee branches) open them now.
        for idx in 0..session.filters.len() {
            if let Err(e) = session.filters[idx].session_start(&mut session.filter_ctx).await {
                warn!(session = id, "filter setup failed: {e}");
                session.teardown().await;
                return Err(e);
            }
        }

        let result = session.command_loop().await;
        session.teardown().await;
        result
    }

    /// Handshake + authentication: `Init -> [ExpectProxyHdr] ->
    /// [ExpectSslReq -> SslNeg] -> ExpectHsResp`, then the auth exchange.
    #[allow(clippy::too_many_arguments)]
    async fn handshake(
        mut stream: AnyStream,
        remote: std::net::SocketAddr,
        config: SessionConfig,
        worker: Rc<WorkerContext>,
        id: u64,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Session, SqlGateError> {
        let mut descriptor = Descriptor::new(worker.next_dcb_id(), DcbRole::ClientHandler, worker.id);
        descriptor.set_remote(remote);
        descriptor.set_session_id(id);
        descriptor.set_watermarks(config.low_water, config.high_water);
        descriptor.register();

        let mut acc = BufChain::new();
        let mut hs_state = HsState::Init;
        let mut effective_remote = remote;

        // Optional proxy-protocol prelude.
        if let Some(networks) = &config.proxy_networks {
            hs_state = HsState::ExpectProxyHdr;
            trace!(session = id, state = %hs_state, "awaiting proxy header");
            if !networks.is_allowed(remote.ip()) {
                debug!(%remote, "proxy header sender not in allowed networks");
                return Err(SqlGateError::Protocol("proxy header not allowed".into()));
            }
            let header = read_proxy_header(&mut stream, &mut acc).await?;
            if let Some((src, _dst)) = header.addresses {
                effective_remote = src;
                descriptor.set_remote(src);
            }
        }

        // Greeting.
        let scramble = default_scramble();
        let tls_acceptor = config.tls.load_full();
        let caps = advertised_caps(tls_acceptor.is_some());
        let greeting = Handshake {
            server_version: config.server_version.clone(),
            connection_id: id as u32,
            scramble: scramble.clone(),
            capabilities: caps,
            charset: 8,
            status: StatusFlags::AUTOCOMMIT,
            auth_plugin: NATIVE_PLUGIN.to_string(),
        };
        stream
            .write_all(&codec::build_packet(0, &greeting.build()).to_vec())
            .await?;
        stream.flush().await?;
        hs_state = HsState::ExpectHsResp;
        trace!(session = id, state = %hs_state, "greeting sent");

        // Handshake response, possibly preceded by an SSLRequest.
        let mut packet = read_one_packet(&mut stream, &mut acc).await?;
        let mut body = packet.to_vec().split_off(4);
        if HandshakeResponse::is_ssl_request(&body) {
            let Some(tls) = &tls_acceptor else {
                return Err(SqlGateError::Tls("listener has no TLS configured".into()));
            };
            hs_state = HsState::SslNeg;
            trace!(session = id, state = %hs_state, "client requested TLS");
            let AnyStream::Tcp(tcp) = stream else {
                return Err(SqlGateError::Tls("double TLS upgrade".into()));
            };
            let tls_stream = tls
                .accept(tcp)
                .await
                .map_err(|e| SqlGateError::Tls(e.to_string()))?;
            stream = AnyStream::Tls(Box::new(tls_stream));
            descriptor.set_tls(crate::core::worker::TlsState::Established);
            hs_state = HsState::ExpectHsResp;
            trace!(session = id, state = %hs_state, "TLS established");
            packet = read_one_packet(&mut stream, &mut acc).await?;
            body = packet.to_vec().split_off(4);
        }
        let response_seq = codec::peek_header(&packet).map(|h| h.seq).unwrap_or(1);
        let response = HandshakeResponse::parse(&body)?;
        hs_state = HsState::Complete;
        trace!(session = id, state = %hs_state, user = %response.user, "handshake complete");
        let client_caps = response.capabilities & caps;

        // Authentication. The events channel exists up front so a
        // passthrough probe connection can already be wired to it.
        let (events_tx, backend_events) = mpsc::unbounded_channel();
        let mut auth_state = AuthState::FindEntry;
        let ssl = descriptor.tls() == crate::core::worker::TlsState::Established;

        if config.passthrough_auth {
            // Passthrough: the backend adjudicates. Relay the master's own
            // scramble to the client as an auth switch, then relay the
            // client's recomputed token to the master.
            auth_state = AuthState::WaitForBackend;
            trace!(session = id, state = %auth_state, "passthrough authentication");
            let auth = passthrough_auth(
                &mut stream,
                &mut acc,
                &config,
                &worker,
                &response,
                response_seq,
                events_tx.clone(),
            )
            .await?;
            let db = auth.db.clone();
            return Session::assemble(
                id,
                worker,
                config,
                descriptor,
                AuthState::Complete,
                scramble,
                client_caps,
                auth,
                db,
                effective_remote,
                events_tx,
                backend_events,
                read_write(stream),
                acc,
                shutdown_rx,
            );
        }

        let mut users = worker.users.reader_ready();
        let unknown = users
            .lookup(
                &response.user,
                effective_remote.ip(),
                response.db.as_deref(),
                ssl,
            )
            .is_err_and(|e| e == LookupError::UnknownUser);
        if unknown {
            // One rate-limited on-demand refresh plus a retry against the
            // latest table covers accounts created moments ago.
            auth_state = AuthState::TryAgain;
            trace!(session = id, state = %auth_state, "user not found, retrying lookup");
            config.registry.request_user_refresh();
            users = worker.users.reader_ready();
        }
        let lookup = users.lookup(
            &response.user,
            effective_remote.ip(),
            response.db.as_deref(),
            ssl,
        );
        let entry = match lookup {
            Ok(entry) => entry,
            Err(e) => {
                let (code, message) = match e {
                    LookupError::UnknownUser => (
                        error_codes::ER_ACCESS_DENIED,
                        format!(
                            "Access denied for user '{}'@'{}'",
                            response.user,
                            effective_remote.ip()
                        ),
                    ),
                    LookupError::NoDbAccess => (
                        error_codes::ER_DBACCESS_DENIED,
                        format!(
                            "Access denied for user '{}' to database '{}'",
                            response.user,
                            response.db.as_deref().unwrap_or("")
                        ),
                    ),
                    LookupError::NoSslConnection => (
                        error_codes::ER_ACCESS_DENIED,
                        format!("Access denied for user '{}': SSL required", response.user),
                    ),
                };
                write_err(&mut stream, response_seq.wrapping_add(1), code, &message).await?;
                return Err(SqlGateError::Auth { code, message });
            }
        };

        if entry.auth_plugin != NATIVE_PLUGIN {
            auth_state = AuthState::NoPlugin;
            trace!(session = id, state = %auth_state, plugin = %entry.auth_plugin, "unsupported plugin");
            let message = format!("Plugin '{}' is not loaded", entry.auth_plugin);
            write_err(
                &mut stream,
                response_seq.wrapping_add(1),
                error_codes::ER_PLUGIN_NOT_LOADED,
                &message,
            )
            .await?;
            return Err(SqlGateError::Auth {
                code: error_codes::ER_PLUGIN_NOT_LOADED,
                message,
            });
        }

        auth_state = AuthState::CheckToken;
        trace!(session = id, state = %auth_state, "verifying token");
        let Some(stage1) = verify_token(&scramble, &entry.auth_token_hash, &response.auth_response)
        else {
            let message = format!(
                "Access denied for user '{}'@'{}' (using password: {})",
                response.user,
                effective_remote.ip(),
                if response.auth_response.is_empty() { "NO" } else { "YES" }
            );
            write_err(
                &mut stream,
                response_seq.wrapping_add(1),
                error_codes::ER_ACCESS_DENIED,
                &message,
            )
            .await?;
            return Err(SqlGateError::Auth {
                code: error_codes::ER_ACCESS_DENIED,
                message,
            });
        };

        auth_state = AuthState::StartSession;
        trace!(session = id, state = %auth_state, "starting session");
        let db = response.db.clone().or(entry.default_db.clone());
        let auth = BackendAuth {
            user: response.user.clone(),
            stage1,
            db: db.clone(),
            charset: response.charset,
        };

        let ok = OkPacket::build(0, 0, StatusFlags::AUTOCOMMIT);
        stream
            .write_all(&codec::build_packet(response_seq.wrapping_add(1), &ok).to_vec())
            .await?;
        stream.flush().await?;
        auth_state = AuthState::Complete;

        Session::assemble(
            id,
            worker,
            config,
            descriptor,
            auth_state,
            scramble,
            client_caps,
            auth,
            db,
            effective_remote,
            events_tx,
            backend_events,
            read_write(stream),
            acc,
            shutdown_rx,
        )
    }

    /// Builds the ready session once authentication completed: filter chain
    /// instances, router session, registration plumbing.
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: u64,
        worker: Rc<WorkerContext>,
        config: SessionConfig,
        mut descriptor: Descriptor,
        auth_state: AuthState,
        scramble: Vec<u8>,
        client_caps: Capabilities,
        auth: BackendAuth,
        db: Option<String>,
        effective_remote: std::net::SocketAddr,
        events_tx: mpsc::UnboundedSender<(u64, BackendEvent)>,
        backend_events: mpsc::UnboundedReceiver<(u64, BackendEvent)>,
        halves: (ReadHalf<AnyStream>, WriteHalf<AnyStream>),
        acc: BufChain,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Session, SqlGateError> {
        info!(
            session = id,
            user = %auth.user,
            remote = %effective_remote,
            service = %config.service.name,
            "session authenticated"
        );
        let filter_ctx = FilterCtx {
            session_id: id,
            user: auth.user.clone(),
            remote: effective_remote.to_string(),
            service: config.service.name.clone(),
            registry: config.registry.clone(),
            db,
            backend_auth: auth.clone(),
            in_trx: false,
            trx_read_only: true,
            request_seq: 0,
            kill_session: false,
        };
        let mut filters = Vec::with_capacity(config.service.filters.len());
        for module in &config.service.filters {
            filters.push(module.new_session(&filter_ctx)?);
        }
        let router = make_router_session(
            config.service.clone(),
            worker.clone(),
            auth.clone(),
            events_tx,
        )?;

        descriptor.set_user(auth.user.clone());
        let (read_half, write_half) = halves;

        Ok(Session {
            id,
            worker,
            config,
            descriptor,
            phase: SessionPhase::Ready,
            hs_state: HsState::Complete,
            auth_state,
            scramble,
            client_caps,
            auth,
            classifier: QueryClassifier::new(
                Arc::new(HeuristicInspector),
                ClassifierSettings::default(),
            ),
            filters,
            filter_ctx,
            router,
            change: ChangeTracker::default(),
            change_user_backup: None,
            remembered_master: None,
            busy: false,
            busy_deadline: None,
            downstream_queue: std::collections::VecDeque::new(),
            read_half,
            write_half,
            acc,
            backend_events,
            shutdown_rx,
        })
    }

    /// Diagnostic view of the protocol state machines.
    pub fn protocol_state(&self) -> (SessionPhase, HsState, AuthState) {
        (self.phase, self.hs_state, self.auth_state)
    }

    /// The command-phase event loop. At most one complete client packet is
    /// pulled per turn; LOAD DATA bodies and large-packet continuations
    /// flow even while a reply is pending.
    async fn command_loop(&mut self) -> Result<(), SqlGateError> {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            self.pump_client_packets().await?;
            if self.phase == SessionPhase::Quit || self.phase == SessionPhase::Failed {
                return Ok(());
            }
            if self.filter_ctx.kill_session {
                info!(session = self.id, "session killed by filter");
                return Ok(());
            }

            let deadline = self.busy_deadline;
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!(session = self.id, "session received kill signal");
                    let body = ErrPacket::build(
                        error_codes::ER_CONNECTION_KILLED,
                        "70100",
                        "Connection was killed",
                    );
                    let _ = self.write_client(codec::build_packet(0, &body)).await;
                    return Err(SqlGateError::Killed);
                }
                _ = sleep_until_or_forever(deadline) => {
                    // A query timeout fires the same path as a backend
                    // failure.
                    warn!(session = self.id, "query timed out");
                    self.phase = SessionPhase::Failed;
                    let body = ErrPacket::build(
                        error_codes::CR_CONN_HOST_ERROR,
                        "HY000",
                        "Lost connection to backend server: query timed out",
                    );
                    let _ = self.write_client(codec::build_packet(1, &body)).await;
                    return Err(SqlGateError::Timeout("query".into()));
                }
                event = self.backend_events.recv() => {
                    match event {
                        Some((backend, BackendEvent::Packet(packet))) => {
                            self.on_backend_packet(backend, packet).await?;
                        }
                        Some((backend, BackendEvent::Closed(error))) => {
                            self.on_backend_error(backend, error).await?;
                        }
                        None => return Ok(()),
                    }
                }
                read = self.read_half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(session = self.id, "client hung up");
                            self.phase = SessionPhase::Quit;
                            return Ok(());
                        }
                        Ok(_) => {
                            self.descriptor.buffer_read(BufChain::from_slice(&buf));
                            let pending = std::mem::take(self.descriptor.read_queue());
                            self.acc.append(pending);
                            buf.clear();
                        }
                        Err(e) => {
                            self.descriptor.on_error();
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Pulls client packets while the session is allowed to dispatch them.
    async fn pump_client_packets(&mut self) -> Result<(), SqlGateError> {
        loop {
            // LOAD DATA bodies and multi-packet continuations must flow
            // while the statement's reply is still pending; once the
            // terminator went out, the session waits for the backend again.
            let route_info = self.classifier.route_info();
            let streaming = route_info.load_data_state() == LoadDataState::Active
                || route_info.expecting_large_query();
            if (self.busy && !streaming) || !self.downstream_queue.is_empty() {
                return Ok(());
            }
            let Some(packet) = codec::next_packet(&mut self.acc) else {
                return Ok(());
            };
            self.process_client_packet(packet).await?;
            if self.phase != SessionPhase::Ready {
                return Ok(());
            }
        }
    }

    /// One complete client packet: classify, filter, route.
    async fn process_client_packet(&mut self, packet: BufChain) -> Result<(), SqlGateError> {
        if codec::command_of(&packet) == Some(Command::Quit)
            && !self.classifier.route_info().loading_data()
        {
            debug!(session = self.id, "client sent QUIT");
            self.phase = SessionPhase::Quit;
            return Ok(());
        }

        if codec::command_of(&packet) == Some(Command::ChangeUser)
            && !self.classifier.route_info().loading_data()
            && !self.classifier.route_info().expecting_large_query()
        {
            return self.process_change_user(packet).await;
        }

        self.filter_ctx.request_seq = codec::peek_header(&packet).map(|h| h.seq).unwrap_or(0);
        self.filter_ctx.in_trx = self.classifier.trx().is_trx_active();
        self.filter_ctx.trx_read_only = self.classifier.trx().is_trx_read_only();

        // Down the filter chain.
        let mut current = packet;
        let mut forwards: Vec<BufChain> = Vec::new();
        let filter_count = self.filters.len();
        for idx in 0..filter_count {
            let action = self.filters[idx]
                .route_query(current, &mut self.filter_ctx)
                .await?;
            match action {
                DownstreamAction::Forward(next) => current = next,
                DownstreamAction::ForwardMany(mut many) => {
                    // The last packet continues down the chain; the rest
                    // are queued ahead of it in order.
                    let Some(last) = many.pop() else {
                        return Ok(());
                    };
                    forwards.extend(many);
                    current = last;
                }
                DownstreamAction::Consume => return Ok(()),
                DownstreamAction::Respond(reply) => {
                    return self.deliver_synthetic_reply(idx, reply).await;
                }
                DownstreamAction::RespondAndForward { reply, forward } => {
                    self.deliver_synthetic_reply(idx, reply).await?;
                    for pkt in forward {
                        self.route_downstream(pkt).await?;
                    }
                    return Ok(());
                }
            }
        }
        forwards.push(current);

        let mut queue: std::collections::VecDeque<BufChain> = forwards.into();
        let Some(first) = queue.pop_front() else {
            return Ok(());
        };
        self.downstream_queue = queue;
        self.route_downstream(first).await?;
        self.maybe_route_queued().await
    }

    /// Classifies and routes one packet that finished the filter chain.
    async fn route_downstream(&mut self, packet: BufChain) -> Result<(), SqlGateError> {
        // Temp tables do not survive a master switchover.
        let master = self.router.master_name();
        if self.remembered_master.is_some() && master != self.remembered_master {
            self.classifier.master_switchover();
        }
        self.remembered_master = master;

        let info = self.classifier.update_route_info(&packet).clone();
        if info.type_mask().contains(TypeMask::SESSION_WRITE)
            && self.change.pending() == &SessionChange::None
        {
            if let Some(Command::InitDb) = info.command() {
                let body = packet.to_vec().split_off(5);
                self.change
                    .set_pending(SessionChange::Db(String::from_utf8_lossy(&body).into_owned()));
            }
        }

        let expecting =
            info.expecting_response() || info.load_data_state() == LoadDataState::Active;
        match self.router.route_query(&info, packet).await {
            Ok(()) => {
                if expecting {
                    self.busy = true;
                    let timeout = self.config.service.config.query_timeout;
                    self.busy_deadline = (!timeout.is_zero())
                        .then(|| tokio::time::Instant::now() + timeout);
                }
                Ok(())
            }
            Err(e) => {
                // The request could not be dispatched; the classifier state
                // must roll back so the next attempt starts clean.
                self.classifier.revert_update();
                warn!(session = self.id, "routing failed: {e}");
                let body = ErrPacket::build(
                    error_codes::CR_CONN_HOST_ERROR,
                    "HY000",
                    &format!("Could not route query: {e}"),
                );
                let seq = self.filter_ctx.next_owned_seq();
                self.write_client(codec::build_packet(seq, &body)).await?;
                self.phase = SessionPhase::Failed;
                Ok(())
            }
        }
    }

    /// Routes queued downstream packets while no reply is outstanding.
    async fn maybe_route_queued(&mut self) -> Result<(), SqlGateError> {
        while !self.busy
            && let Some(packet) = self.downstream_queue.pop_front()
        {
            self.route_downstream(packet).await?;
        }
        Ok(())
    }

    /// COM_CHANGE_USER: re-authenticate locally against the original
    /// scramble, keep a backup of the previous identity, forward on
    /// success.
    async fn process_change_user(&mut self, packet: BufChain) -> Result<(), SqlGateError> {
        self.phase = SessionPhase::ChangingUser;
        let body = packet.to_vec().split_off(4);
        let change = ChangeUser::parse(&body, self.client_caps)?;
        let users = self.worker.users.reader_ready();
        let remote_ip = self
            .descriptor
            .remote()
            .map(|a| a.ip())
            .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
        let ssl = self.descriptor.tls() == crate::core::worker::TlsState::Established;

        let entry = users.lookup(&change.user, remote_ip, change.db.as_deref(), ssl);
        let verified = entry.ok().and_then(|entry| {
            verify_token(&self.scramble, &entry.auth_token_hash, &change.auth_response)
        });
        let Some(stage1) = verified else {
            let message = format!("Access denied for user '{}'", change.user);
            let seq = codec::peek_header(&packet)
                .map(|h| h.seq.wrapping_add(1))
                .unwrap_or(1);
            self.write_client(codec::build_packet(
                seq,
                &ErrPacket::build(error_codes::ER_ACCESS_DENIED, "28000", &message),
            ))
            .await?;
            self.phase = SessionPhase::Ready;
            return Ok(());
        };

        // Keep the old identity so a backend failure can restore it.
        self.change_user_backup = Some(self.auth.clone());
        self.auth_state = AuthState::ChangeUserOk;
        self.change.set_pending(SessionChange::User(change.user.clone()));
        self.auth = BackendAuth {
            user: change.user,
            stage1,
            db: change.db,
            charset: change.charset,
        };
        self.phase = SessionPhase::Ready;

        // The command itself is a session command; the router fans it out.
        self.filter_ctx.request_seq = codec::peek_header(&packet).map(|h| h.seq).unwrap_or(0);
        let info = self.classifier.update_route_info(&packet).clone();
        self.router.route_query(&info, packet).await?;
        self.busy = true;
        Ok(())
    }

    /// A reply synthesized by filter `idx`: it travels up through the
    /// filters above it, then to the client.
    async fn deliver_synthetic_reply(
        &mut self,
        idx: usize,
        reply: BufChain,
    ) -> Result<(), SqlGateError> {
        let tracker = ReplyTracker::synthetic_complete();
        let mut current = Some(reply);
        for above in (0..idx).rev() {
            let Some(packet) = current.take() else { break };
            let verdict = self.filters[above]
                .client_reply(packet, &tracker, &mut self.filter_ctx)
                .await?;
            for injected in verdict.to_backend {
                self.downstream_queue.push_back(injected);
            }
            current = verdict.to_client;
        }
        if let Some(packet) = current {
            self.write_client(packet).await?;
        }
        self.maybe_route_queued().await
    }

    /// One packet from a backend: router first, then up the filter chain.
    async fn on_backend_packet(
        &mut self,
        backend: u64,
        packet: BufChain,
    ) -> Result<(), SqlGateError> {
        let delivery = self.router.handle_reply(backend, packet).await;
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(SqlGateError::ChecksumMismatch) => {
                self.filter_ctx.kill_session = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if delivery.completed {
            if let Some(tracker) = self.router.reply_tracker() {
                self.classifier.track_reply(tracker);
            }
            self.apply_pending_change();
        }

        let synthetic = ReplyTracker::synthetic_complete();
        for packet in delivery.to_client {
            // Up through the filter chain in reverse order.
            let mut current = Some(packet);
            for idx in (0..self.filters.len()).rev() {
                let Some(pkt) = current.take() else { break };
                let tracker = self.router.reply_tracker().unwrap_or(&synthetic);
                let verdict = self.filters[idx]
                    .client_reply(pkt, tracker, &mut self.filter_ctx)
                    .await;
                let verdict = match verdict {
                    Ok(verdict) => verdict,
                    Err(SqlGateError::ChecksumMismatch) => {
                        self.filter_ctx.kill_session = true;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                for injected in verdict.to_backend {
                    self.downstream_queue.push_back(injected);
                }
                current = verdict.to_client;
            }
            if let Some(pkt) = current {
                self.write_client(pkt).await?;
            }
        }

        if delivery.completed {
            self.busy = false;
            self.busy_deadline = None;
            self.maybe_route_queued().await?;
        }
        Ok(())
    }

    /// The backend confirmed (or denied) a pending session change.
    fn apply_pending_change(&mut self) {
        if !self.change.is_pending() {
            return;
        }
        let ok = self
            .router
            .reply_tracker()
            .map(|t| t.error().is_none())
            .unwrap_or(true);
        if !ok {
            // A failed CHANGE_USER restores the previous identity.
            if let Some(backup) = self.change_user_backup.take()
                && matches!(self.change.pending(), SessionChange::User(_))
            {
                self.auth = backup;
            }
            self.change.discard();
            return;
        }
        match self.change.commit() {
            SessionChange::Db(db) => {
                self.auth.db = Some(db.clone());
                self.filter_ctx.db = Some(db);
            }
            SessionChange::User(user) => {
                self.change_user_backup = None;
                self.filter_ctx.user = user.clone();
                self.filter_ctx.backend_auth = self.auth.clone();
                self.descriptor.set_user(user);
            }
            SessionChange::Role(_) | SessionChange::None => {}
        }
    }

    async fn on_backend_error(
        &mut self,
        backend: u64,
        error: SqlGateError,
    ) -> Result<(), SqlGateError> {
        match self.router.handle_backend_error(backend, error).await? {
            ErrorVerdict::Continue => Ok(()),
            ErrorVerdict::Fail(err_packet) => {
                self.phase = SessionPhase::Failed;
                let _ = self.write_client(err_packet).await;
                Ok(())
            }
        }
    }

    /// Writes one packet to the client through the descriptor's write
    /// queue, so watermark accounting stays exact.
    async fn write_client(&mut self, packet: BufChain) -> Result<(), SqlGateError> {
        self.descriptor.enqueue_write(packet);
        let chain = self.descriptor.dequeue_write(usize::MAX);
        self.write_half.write_all(&chain.to_vec()).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    async fn teardown(&mut self) {
        debug!(session = self.id, phase = %self.phase, "session closing");
        for filter in self.filters.iter_mut() {
            filter.on_session_close(&mut self.filter_ctx);
        }
        self.router.close().await;
        self.config.registry.unregister_session(self.id);
        self.worker.unregister_session(self.id);
        self.descriptor.close();
        let _ = self.write_half.shutdown().await;
    }
}

async fn write_err(
    stream: &mut AnyStream,
    seq: u8,
    code: u16,
    message: &str,
) -> Result<(), SqlGateError> {
    let sqlstate = match code {
        error_codes::ER_ACCESS_DENIED | error_codes::ER_DBACCESS_DENIED => "28000",
        error_codes::ER_BAD_DB => "42000",
        _ => "HY000",
    };
    let body = ErrPacket::build(code, sqlstate, message);
    stream
        .write_all(&codec::build_packet(seq, &body).to_vec())
        .await?;
    stream.flush().await?;
    Ok(())
}

async fn read_one_packet(
    stream: &mut AnyStream,
    acc: &mut BufChain,
) -> Result<BufChain, SqlGateError> {
    loop {
        if let Some(packet) = codec::next_packet(acc) {
            return Ok(packet);
        }
        let mut buf = BytesMut::with_capacity(4096);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(SqlGateError::Hangup);
        }
        acc.append_bytes(&buf);
    }
}

/// Reads and validates the proxy-protocol prelude, leaving any trailing
/// bytes in `acc`.
async fn read_proxy_header(
    stream: &mut AnyStream,
    acc: &mut BufChain,
) -> Result<proxy_header::ProxyHeader, SqlGateError> {
    loop {
        let head = acc.to_vec();
        match proxy_header::preparse(&head) {
            PreParseResult::Text(len) => {
                let header = acc.split_front(len).to_vec();
                return proxy_header::parse_text_header(&header);
            }
            PreParseResult::Binary(len) => {
                if head.len() < len {
                    // Fall through to read more; the length is known.
                } else {
                    let header = acc.split_front(len).to_vec();
                    return proxy_header::parse_binary_header(&header);
                }
            }
            PreParseResult::Incomplete => {}
            PreParseResult::Error => {
                return Err(SqlGateError::Protocol("malformed proxy header".into()));
            }
        }
        let mut buf = BytesMut::with_capacity(256);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(SqlGateError::Hangup);
        }
        acc.append_bytes(&buf);
    }
}

fn read_write(stream: AnyStream) -> (ReadHalf<AnyStream>, WriteHalf<AnyStream>) {
    tokio::io::split(stream)
}

/// Sleeps until the deadline, or forever when no reply is outstanding.
async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Passthrough authentication: the service's master adjudicates. The
/// master's own scramble is relayed to the client as an auth-switch
/// request, the client's recomputed token is relayed back, and the
/// backend's OK/ERR decides the outcome. The authenticated probe
/// connection is parked in the worker pool so the router's first master
/// connect reuses it.
async fn passthrough_auth(
    stream: &mut AnyStream,
    acc: &mut BufChain,
    config: &SessionConfig,
    worker: &Rc<WorkerContext>,
    response: &HandshakeResponse,
    response_seq: u8,
    events: mpsc::UnboundedSender<(u64, BackendEvent)>,
) -> Result<BackendAuth, SqlGateError> {
    let snapshot = worker.servers.reader_ready();
    let master = snapshot
        .master()
        .map(|(name, _)| name.to_string())
        .and_then(|name| {
            config
                .service
                .servers
                .iter()
                .find(|s| s.name == name)
                .cloned()
        });
    let Some(master) = master else {
        let message = "no master available for passthrough authentication".to_string();
        write_err(
            stream,
            response_seq.wrapping_add(1),
            error_codes::ER_ACCESS_DENIED,
            &message,
        )
        .await?;
        return Err(SqlGateError::Auth {
            code: error_codes::ER_ACCESS_DENIED,
            message,
        });
    };
    let pending = PendingConnect::open(master).await?;

    // Auth-switch request carrying the backend's scramble.
    let mut switch = vec![0xFE];
    switch.extend_from_slice(NATIVE_PLUGIN.as_bytes());
    switch.push(0);
    switch.extend_from_slice(pending.scramble());
    switch.push(0);
    stream
        .write_all(&codec::build_packet(response_seq.wrapping_add(1), &switch).to_vec())
        .await?;
    stream.flush().await?;

    let token_packet = read_one_packet(stream, acc).await?;
    let token_seq = codec::peek_header(&token_packet).map(|h| h.seq).unwrap_or(3);
    let token = token_packet.to_vec().split_off(4);

    let authenticated = pending
        .authenticate(
            &response.user,
            response.db.as_deref(),
            response.charset,
            TokenSource::Raw(token),
            worker,
            events,
        )
        .await;
    let endpoint = match authenticated {
        Ok(endpoint) => endpoint,
        Err(SqlGateError::Auth { code, message }) => {
            // The backend's verdict, relayed verbatim.
            write_err(stream, token_seq.wrapping_add(1), code, &message).await?;
            return Err(SqlGateError::Auth { code, message });
        }
        Err(e) => return Err(e),
    };

    // Park the probe for the router to check out.
    endpoint.park_events();
    let imprint = endpoint.imprint();
    let server_name = endpoint.server.name.clone();
    let parked = worker
        .pool
        .borrow_mut()
        .park(&server_name, endpoint, imprint);
    if let Err(endpoint) = parked {
        endpoint.close().await;
    }

    let ok = OkPacket::build(0, 0, StatusFlags::AUTOCOMMIT);
    stream
        .write_all(&codec::build_packet(token_seq.wrapping_add(1), &ok).to_vec())
        .await?;
    stream.flush().await?;

    Ok(BackendAuth {
        user: response.user.clone(),
        stage1: Vec::new(),
        db: response.db.clone(),
        charset: response.charset,
    })
}
