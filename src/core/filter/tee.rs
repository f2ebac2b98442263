// src/core/filter/tee.rs

//! Tee filter: duplicates client requests onto a branch session against
//! another service.
//!
//! The branch is a local client that opens its own connection against the
//! target service when the session starts. Each matching client request is
//! shallow-cloned and forwarded to the branch. With `sync=true` the next
//! client request is held until both the main reply and the branch reply
//! completed, and a branch disconnect kills the whole session; with
//! `sync=false` the branch is best-effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{
    DownstreamAction, FilterCtx, FilterModule, FilterSession, SessionScope, UpstreamVerdict,
};
use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::reply::{ReplyTracker, ReplyEvent};
use crate::core::session::auth::BackendAuth;
use crate::core::session::backend::{BackendEndpoint, BackendEvent};
use crate::core::SqlGateError;

#[derive(Debug, Clone)]
pub struct TeeConfig {
    /// The service whose master receives the branched traffic.
    pub target: String,
    pub match_pattern: Option<String>,
    pub exclude_pattern: Option<String>,
    pub scope: SessionScope,
    pub sync: bool,
}

pub struct TeeFilter {
    name: String,
    config: TeeConfig,
    match_re: Option<Regex>,
    exclude_re: Option<Regex>,
    branched: Arc<AtomicU64>,
    branch_failures: Arc<AtomicU64>,
}

impl TeeFilter {
    pub fn new(name: &str, config: TeeConfig) -> Result<Self, SqlGateError> {
        let match_re = config.match_pattern.as_deref().map(Regex::new).transpose()?;
        let exclude_re = config
            .exclude_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(TeeFilter {
            name: name.to_string(),
            config,
            match_re,
            exclude_re,
            branched: Arc::new(AtomicU64::new(0)),
            branch_failures: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl FilterModule for TeeFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        Ok(Box::new(TeeSession {
            target: self.config.target.clone(),
            sync: self.config.sync,
            active: self.config.scope.applies(&ctx.remote, &ctx.user),
            match_re: self.match_re.clone(),
            exclude_re: self.exclude_re.clone(),
            branch: None,
            sent: 0,
            main_completed: 0,
            branched: self.branched.clone(),
            branch_failures: self.branch_failures.clone(),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "target": self.config.target,
            "sync": self.config.sync,
            "queries_branched": self.branched.load(Ordering::Relaxed),
            "branch_failures": self.branch_failures.load(Ordering::Relaxed),
        })
    }
}

/// The branch: a task owning one connection to the target, fed requests
/// through a channel and reporting completed replies through a watch.
struct Branch {
    tx: mpsc::UnboundedSender<BufChain>,
    completed: watch::Receiver<u64>,
}

/// Drives the branch connection: write one request, consume its reply,
/// report completion.
async fn run_branch(
    mut endpoint: BackendEndpoint,
    mut events: mpsc::UnboundedReceiver<(u64, BackendEvent)>,
    mut requests: mpsc::UnboundedReceiver<BufChain>,
    completed: watch::Sender<u64>,
) {
    let mut tracker = ReplyTracker::new(endpoint.capabilities());
    let mut done: u64 = 0;
    while let Some(packet) = requests.recv().await {
        let expects_reply = codec::command_of(&packet)
            .map(|c| c.will_respond())
            .unwrap_or(true);
        if let Some(cmd) = codec::command_of(&packet) {
            tracker.start(cmd);
        }
        if endpoint.write_packet(&packet).await.is_err() {
            return;
        }
        if !expects_reply {
            done += 1;
            let _ = completed.send(done);
            continue;
        }
        loop {
            match events.recv().await {
                Some((_, BackendEvent::Packet(reply))) => {
                    match tracker.process(&reply) {
                        Ok(ReplyEvent::Complete) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("tee branch reply error: {e}");
                            return;
                        }
                    }
                }
                Some((_, BackendEvent::Closed(_))) | None => return,
            }
        }
        done += 1;
        let _ = completed.send(done);
    }
    endpoint.close().await;
}

struct TeeSession {
    target: String,
    sync: bool,
    active: bool,
    match_re: Option<Regex>,
    exclude_re: Option<Regex>,
    branch: Option<Branch>,
    /// Requests sent to the branch.
    sent: u64,
    /// Main replies completed (for the sync lockstep).
    main_completed: u64,
    branched: Arc<AtomicU64>,
    branch_failures: Arc<AtomicU64>,
}

impl TeeSession {
    fn matches(&self, packet: &BufChain) -> bool {
        let Some(sql) = codec::sql_of(packet) else {
            // Non-query commands are branched so the two sessions stay in
            // equivalent states.
            return true;
        };
        if let Some(re) = &self.match_re
            && !re.is_match(&sql)
        {
            return false;
        }
        if let Some(re) = &self.exclude_re
            && re.is_match(&sql)
        {
            return false;
        }
        true
    }

    /// Waits until the branch has caught up with everything sent to it.
    async fn await_branch(&mut self, ctx: &mut FilterCtx) -> Result<(), SqlGateError> {
        let mut completed = match &self.branch {
            Some(branch) => branch.completed.clone(),
            None => return Ok(()),
        };
        loop {
            if *completed.borrow() >= self.sent {
                return Ok(());
            }
            if completed.changed().await.is_err() {
                // The branch died mid-conversation.
                self.branch = None;
                self.branch_failures.fetch_add(1, Ordering::Relaxed);
                if self.sync {
                    warn!(session = ctx.session_id, "tee branch disconnected, killing session");
                    ctx.kill_session = true;
                    return Err(SqlGateError::Filter("tee branch disconnected".into()));
                }
                return Ok(());
            }
        }
    }
}

#[async_trait(?Send)]
impl FilterSession for TeeSession {
    async fn session_start(&mut self, ctx: &mut FilterCtx) -> Result<(), SqlGateError> {
        if !self.active {
            return Ok(());
        }
        let Some(service) = ctx.registry.service(&self.target) else {
            return Err(SqlGateError::Config(format!(
                "tee target service '{}' does not exist",
                self.target
            )));
        };
        // The branch goes to the target's master; without one, the first
        // running server.
        let snapshot = ctx.registry.cluster_snapshot();
        let server = service
            .servers
            .iter()
            .find(|s| snapshot.status_of(&s.name).is_master())
            .or_else(|| {
                service
                    .servers
                    .iter()
                    .find(|s| snapshot.status_of(&s.name).is_usable())
            })
            .cloned()
            .ok_or_else(|| {
                SqlGateError::NoBackend(format!("tee target '{}' has no usable server", self.target))
            })?;

        let auth = BackendAuth {
            user: ctx.user.clone(),
            stage1: ctx.backend_auth.stage1.clone(),
            db: ctx.db.clone(),
            charset: ctx.backend_auth.charset,
        };
        let worker = crate::core::worker::context();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let endpoint = BackendEndpoint::connect(server, &auth, &worker, events_tx).await?;

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(0u64);
        tokio::task::spawn_local(run_branch(endpoint, events_rx, req_rx, done_tx));
        debug!(session = ctx.session_id, target = %self.target, "tee branch connected");
        self.branch = Some(Branch {
            tx: req_tx,
            completed: done_rx,
        });
        Ok(())
    }

    async fn route_query(
        &mut self,
        packet: BufChain,
        ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        if self.branch.is_none() {
            return Ok(DownstreamAction::Forward(packet));
        }
        if self.sync {
            // Request i+1 waits for both halves of reply i.
            self.await_branch(ctx).await?;
        }
        if self.matches(&packet) {
            let clone = packet.shallow_clone();
            let branch_alive = self
                .branch
                .as_ref()
                .map(|b| b.tx.send(clone).is_ok())
                .unwrap_or(false);
            if branch_alive {
                self.sent += 1;
                self.branched.fetch_add(1, Ordering::Relaxed);
            } else {
                self.branch = None;
                self.branch_failures.fetch_add(1, Ordering::Relaxed);
                if self.sync {
                    ctx.kill_session = true;
                    return Err(SqlGateError::Filter("tee branch disconnected".into()));
                }
            }
        }
        Ok(DownstreamAction::Forward(packet))
    }

    async fn client_reply(
        &mut self,
        packet: BufChain,
        reply: &ReplyTracker,
        ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError> {
        if reply.is_complete() {
            self.main_completed += 1;
            if self.sync {
                // Hold the reply until the branch finished the same
                // statement, stalling mainline routing if needed.
                self.await_branch(ctx).await?;
            }
        }
        Ok(UpstreamVerdict::forward(packet))
    }
}
