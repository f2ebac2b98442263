// src/core/session/backend.rs

//! Backend-side protocol connection.
//!
//! `BackendEndpoint` owns the write half of one authenticated backend
//! connection plus its descriptor; a reader task owns the read half and
//! feeds complete packets (tagged with the descriptor id) into the
//! session's event channel. Connecting walks `Connecting ->
//! ExpectHandshake -> Authenticating -> Ready`; packets written before
//! authentication completes wait in the descriptor's delay queue and are
//! flushed in order once the backend is ready.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::auth::{scramble_response, BackendAuth, NATIVE_PLUGIN};
use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::constants::{Capabilities, HEADER_LEN};
use crate::core::protocol::packets::{ErrPacket, Handshake, HandshakeResponse};
use crate::core::state::Server;
use crate::core::worker::{DcbRole, Descriptor, WorkerContext};
use crate::core::SqlGateError;
use crate::server::AnyStream;

/// Events a backend reader pushes toward its session.
#[derive(Debug)]
pub enum BackendEvent {
    Packet(BufChain),
    Closed(SqlGateError),
}

type EventSlot = Rc<RefCell<Option<mpsc::UnboundedSender<(u64, BackendEvent)>>>>;

/// How the handshake-response token toward a backend is produced.
pub enum TokenSource {
    /// Computed from the stage-1 password hash against the backend's
    /// scramble (the normal case).
    Stage1(Vec<u8>),
    /// A raw token relayed verbatim (passthrough authentication: the token
    /// was computed by the client against this backend's scramble).
    Raw(Vec<u8>),
}

impl TokenSource {
    fn response(&self, scramble: &[u8]) -> Vec<u8> {
        match self {
            TokenSource::Stage1(stage1) => scramble_response(scramble, stage1),
            TokenSource::Raw(token) => token.clone(),
        }
    }
}

/// The session-side handle to one backend connection.
///
/// The endpoint can be parked in the worker's persistent pool between
/// sessions: parking unbinds the event destination (the reader keeps
/// running and marks the endpoint dead on any traffic while parked, since
/// mid-protocol bytes on an idle connection mean it is no longer usable)
/// and a later checkout rebinds it to the new session's channel.
pub struct BackendEndpoint {
    pub server: Arc<Server>,
    pub descriptor: Descriptor,
    writer: WriteHalf<AnyStream>,
    caps: Capabilities,
    events_slot: EventSlot,
    dead: Rc<Cell<bool>>,
    imprint: crate::core::worker::SessionImprint,
}

/// A backend connection whose greeting has been read but whose
/// authentication has not been answered yet. Passthrough authentication
/// pauses here so the client can compute a token for this backend's
/// scramble.
pub struct PendingConnect {
    server: Arc<Server>,
    stream: AnyStream,
    acc: BufChain,
    handshake: Handshake,
}

impl PendingConnect {
    /// Opens the TCP connection and reads the greeting: `Connecting ->
    /// ExpectHandshake`.
    pub async fn open(server: Arc<Server>) -> Result<PendingConnect, SqlGateError> {
        debug!(server = %server.name, "connecting to backend");
        let stream = TcpStream::connect(server.connect_addr()).await?;
        stream.set_nodelay(true).ok();
        let mut stream = AnyStream::Tcp(stream);
        let mut acc = BufChain::new();
        let greeting = read_one_packet(&mut stream, &mut acc).await?;
        let body = packet_body(&greeting);
        let handshake = Handshake::parse(&body)?;
        Ok(PendingConnect {
            server,
            stream,
            acc,
            handshake,
        })
    }

    /// The scramble this backend expects a token for.
    pub fn scramble(&self) -> &[u8] {
        &self.handshake.scramble
    }

    pub fn auth_plugin(&self) -> &str {
        &self.handshake.auth_plugin
    }

    /// Answers the authentication exchange and registers the connection on
    /// the current worker: `Authenticating -> Ready`. Complete packets read
    /// from it will arrive on `events` tagged with the descriptor's id.
    pub async fn authenticate(
        self,
        user: &str,
        db: Option<&str>,
        charset: u8,
        token: TokenSource,
        worker: &WorkerContext,
        events: mpsc::UnboundedSender<(u64, BackendEvent)>,
    ) -> Result<BackendEndpoint, SqlGateError> {
        let PendingConnect {
            server,
            mut stream,
            mut acc,
            handshake,
        } = self;
        let mut caps = handshake.capabilities
            & (Capabilities::PROTOCOL_41
                | Capabilities::SECURE_CONNECTION
                | Capabilities::PLUGIN_AUTH
                | Capabilities::LOCAL_FILES
                | Capabilities::MULTI_RESULTS
                | Capabilities::PS_MULTI_RESULTS
                | Capabilities::SESSION_TRACK
                | Capabilities::TRANSACTIONS);
        if db.is_some() {
            caps |= Capabilities::CONNECT_WITH_DB;
        }
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet: 0x0100_0000,
            charset,
            user: user.to_string(),
            auth_response: token.response(&handshake.scramble),
            db: db.map(str::to_string),
            plugin: Some(NATIVE_PLUGIN.to_string()),
            attrs: Vec::new(),
        };
        write_raw(&mut stream, &codec::build_packet(1, &response.build())).await?;

        let reply = read_one_packet(&mut stream, &mut acc).await?;
        let mut reply_body = packet_body(&reply);
        if reply_body.first() == Some(&0xFE) {
            // Auth switch request: the backend wants the exchange redone
            // with the plugin and scramble it names. Only possible when the
            // stage-1 hash is at hand; a relayed token cannot be recomputed.
            let mut pos = 1;
            let plugin =
                crate::core::protocol::packets::read_null_str(&reply_body, &mut pos)?.to_vec();
            if plugin != NATIVE_PLUGIN.as_bytes() {
                return Err(SqlGateError::Auth {
                    code: crate::core::protocol::constants::error_codes::ER_PLUGIN_NOT_LOADED,
                    message: format!(
                        "backend requested unsupported plugin '{}'",
                        String::from_utf8_lossy(&plugin)
                    ),
                });
            }
            let TokenSource::Stage1(stage1) = &token else {
                return Err(SqlGateError::Auth {
                    code: crate::core::protocol::constants::error_codes::ER_ACCESS_DENIED,
                    message: "backend re-challenged a passthrough token".into(),
                });
            };
            let scramble = &reply_body[pos..reply_body.len().saturating_sub(1)];
            let switched = scramble_response(scramble, stage1);
            let seq = codec::peek_header(&reply).map(|h| h.seq).unwrap_or(2);
            write_raw(&mut stream, &codec::build_packet(seq.wrapping_add(1), &switched)).await?;
            let final_reply = read_one_packet(&mut stream, &mut acc).await?;
            reply_body = packet_body(&final_reply);
        }
        match reply_body.first() {
            Some(&0x00) => {}
            Some(&0xFF) => {
                let err = ErrPacket::parse(&reply_body)?;
                return Err(SqlGateError::Auth {
                    code: err.code,
                    message: err.message,
                });
            }
            other => {
                return Err(SqlGateError::Protocol(format!(
                    "unexpected backend auth reply {other:?}"
                )));
            }
        }

        // Ready: register the descriptor and hand the read half to its
        // reader task.
        let mut descriptor = Descriptor::new(worker.next_dcb_id(), DcbRole::BackendHandler, worker.id);
        descriptor.set_user(user.to_string());
        descriptor.register();
        server.connection_opened();

        let events_slot: EventSlot = Rc::new(RefCell::new(Some(events)));
        let dead = Rc::new(Cell::new(false));
        let (read_half, writer) = tokio::io::split(stream);
        spawn_reader(
            descriptor.id(),
            read_half,
            acc,
            events_slot.clone(),
            dead.clone(),
        );

        debug!(server = %server.name, dcb = descriptor.id(), "backend ready");
        Ok(BackendEndpoint {
            server,
            descriptor,
            writer,
            caps,
            events_slot,
            dead,
            imprint: crate::core::worker::SessionImprint {
                user: user.to_string(),
                db: db.map(str::to_string),
                charset,
            },
        })
    }
}

impl BackendEndpoint {
    /// Opens, authenticates and registers a backend connection on the
    /// current worker using the session's stage-1 credential material.
    pub async fn connect(
        server: Arc<Server>,
        auth: &BackendAuth,
        worker: &WorkerContext,
        events: mpsc::UnboundedSender<(u64, BackendEvent)>,
    ) -> Result<BackendEndpoint, SqlGateError> {
        PendingConnect::open(server)
            .await?
            .authenticate(
                &auth.user,
                auth.db.as_deref(),
                auth.charset,
                TokenSource::Stage1(auth.stage1.clone()),
                worker,
                events,
            )
            .await
    }

    /// The session-state imprint of this connection, for pool matching.
    pub fn imprint(&self) -> crate::core::worker::SessionImprint {
        self.imprint.clone()
    }

    /// True once the connection can no longer be used (peer closed it or
    /// sent unexpected bytes while parked).
    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    /// Unbinds the event destination before parking in the pool.
    pub fn park_events(&self) {
        *self.events_slot.borrow_mut() = None;
    }

    /// Rebinds a checked-out endpoint to its new session's channel.
    pub fn rebind_events(&self, events: mpsc::UnboundedSender<(u64, BackendEvent)>) {
        *self.events_slot.borrow_mut() = Some(events);
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Writes one packet, draining the delay queue first if authentication
    /// raced ahead of the caller.
    pub async fn write_packet(&mut self, packet: &BufChain) -> Result<(), SqlGateError> {
        trace!(dcb = self.descriptor.id(), len = packet.len(), "backend write");
        let data = packet.to_vec();
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Queues a packet for delivery once the backend reaches Ready; the
    /// router drains the delay queue in order at that point.
    pub fn delay_packet(&mut self, packet: BufChain) {
        self.descriptor.delay_queue().append(packet);
    }

    /// Closes the write half and marks the descriptor disconnected.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        self.server.connection_closed();
        self.descriptor.close();
    }
}

fn packet_body(packet: &BufChain) -> Vec<u8> {
    packet.to_vec().split_off(HEADER_LEN)
}

async fn write_raw(stream: &mut AnyStream, packet: &BufChain) -> Result<(), SqlGateError> {
    stream.write_all(&packet.to_vec()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads until one complete packet can be peeled off `acc`.
async fn read_one_packet(
    stream: &mut AnyStream,
    acc: &mut BufChain,
) -> Result<BufChain, SqlGateError> {
    loop {
        if let Some(packet) = codec::next_packet(acc) {
            return Ok(packet);
        }
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(SqlGateError::Hangup);
        }
        acc.append_bytes(&buf);
    }
}

/// The reader task: peels complete packets off the socket and forwards
/// them, tagged, into the currently bound event channel. While parked
/// (no channel bound) any traffic marks the endpoint dead.
fn spawn_reader(
    id: u64,
    mut read_half: ReadHalf<AnyStream>,
    mut acc: BufChain,
    events_slot: EventSlot,
    dead: Rc<Cell<bool>>,
) {
    let deliver = move |event: BackendEvent| -> bool {
        match events_slot.borrow().as_ref() {
            Some(tx) => tx.send((id, event)).is_ok(),
            None => {
                dead.set(true);
                !matches!(event, BackendEvent::Closed(_))
            }
        }
    };
    tokio::task::spawn_local(async move {
        loop {
            while let Some(packet) = codec::next_packet(&mut acc) {
                if !deliver(BackendEvent::Packet(packet)) {
                    return;
                }
            }
            let mut buf = BytesMut::with_capacity(16 * 1024);
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    deliver(BackendEvent::Closed(SqlGateError::Hangup));
                    return;
                }
                Ok(_) => acc.append_bytes(&buf),
                Err(e) => {
                    if !matches!(e.kind(), std::io::ErrorKind::ConnectionReset) {
                        warn!(dcb = id, "backend read error: {e}");
                    }
                    deliver(BackendEvent::Closed(e.into()));
                    return;
                }
            }
        }
    });
}
