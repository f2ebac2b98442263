// src/core/filter/mod.rs

//! The filter pipeline.
//!
//! A session builds `client -> f1 -> ... -> fn -> router`; requests travel
//! down the chain, replies travel up in reverse. Filters own per-session
//! state and may transform, duplicate, absorb or answer packets, but they
//! never reorder packets within a session and must treat buffers as
//! logically immutable unless they call `ensure_unique`.

pub mod insert_stream;
pub mod lua;
pub mod optimistic_trx;
pub mod query_log;
pub mod regex_rewrite;
pub mod tee;
pub mod top_queries;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::buffer::BufChain;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::session::auth::BackendAuth;
use crate::core::state::Registry;
use crate::core::SqlGateError;

/// What a downstream (request) hook decided.
pub enum DownstreamAction {
    /// Pass this packet on toward the router.
    Forward(BufChain),
    /// The filter expanded the request into several packets; all are passed
    /// on in order.
    ForwardMany(Vec<BufChain>),
    /// The filter consumed the packet and will deliver a reply
    /// asynchronously; the caller must not forward.
    Consume,
    /// Short-circuit: deliver this reply upstream instead of routing.
    Respond(BufChain),
    /// Answer the client immediately while still sending packets toward the
    /// backends (e.g. a reshaped bulk insert).
    RespondAndForward {
        reply: BufChain,
        forward: Vec<BufChain>,
    },
}

/// What an upstream (reply) hook decided. Both halves may be used at once:
/// a filter can answer the client while also issuing follow-up packets
/// toward the backends.
pub struct UpstreamVerdict {
    /// Deliver this packet to the client; `None` absorbs the reply.
    pub to_client: Option<BufChain>,
    /// Packets to route toward the backends; they pass through the filters
    /// below this one and are classified as usual.
    pub to_backend: Vec<BufChain>,
}

impl UpstreamVerdict {
    pub fn forward(packet: BufChain) -> Self {
        UpstreamVerdict {
            to_client: Some(packet),
            to_backend: Vec::new(),
        }
    }

    pub fn consume() -> Self {
        UpstreamVerdict {
            to_client: None,
            to_backend: Vec::new(),
        }
    }
}

/// Session facts handed to every hook invocation.
pub struct FilterCtx {
    pub session_id: u64,
    pub user: String,
    pub remote: String,
    pub service: String,
    pub registry: Arc<Registry>,
    pub db: Option<String>,
    /// Credential material for filters that open their own backend
    /// connections (tee branches).
    pub backend_auth: BackendAuth,
    pub in_trx: bool,
    pub trx_read_only: bool,
    /// Sequence of the current client request packet; synthesized replies
    /// take the next value the session owns.
    pub request_seq: u8,
    /// Set by a filter to terminate the whole session.
    pub kill_session: bool,
}

impl FilterCtx {
    /// The next sequence number the session owns for a synthesized packet.
    pub fn next_owned_seq(&self) -> u8 {
        self.request_seq.wrapping_add(1)
    }
}

/// Per-session filter instance.
#[async_trait(?Send)]
pub trait FilterSession {
    /// Runs once when the session is established, before any request flows.
    /// Filters that maintain side connections (tee) open them here.
    async fn session_start(&mut self, _ctx: &mut FilterCtx) -> Result<(), SqlGateError> {
        Ok(())
    }

    /// A client request on its way to the router.
    async fn route_query(
        &mut self,
        packet: BufChain,
        ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError>;

    /// A backend reply packet on its way to the client. Called once per
    /// packet; `reply` carries the accumulated attributes.
    async fn client_reply(
        &mut self,
        packet: BufChain,
        reply: &ReplyTracker,
        ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError>;

    /// The session is closing; flush per-session artifacts.
    fn on_session_close(&mut self, _ctx: &mut FilterCtx) {}
}

/// A configured filter able to mint per-session instances.
pub trait FilterModule: Send + Sync {
    fn name(&self) -> &str;

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError>;

    /// Structured counters for the admin surface.
    fn diagnostics(&self) -> Value;
}

/// Scoping shared by several filters: restrict to a source address and/or
/// user.
#[derive(Debug, Clone, Default)]
pub struct SessionScope {
    pub source: Option<String>,
    pub user: Option<String>,
}

impl SessionScope {
    /// Whether a session with this remote/user is subject to the filter.
    pub fn applies(&self, remote: &str, user: &str) -> bool {
        if let Some(source) = &self.source {
            let host = remote.rsplit_once(':').map(|(h, _)| h).unwrap_or(remote);
            if host != source {
                return false;
            }
        }
        if let Some(want) = &self.user
            && want != user
        {
            return false;
        }
        true
    }
}
