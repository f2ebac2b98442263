// src/core/filter/optimistic_trx.rs

//! Optimistic read-only transactions.
//!
//! A client `BEGIN` is optimistically replaced by `START TRANSACTION READ
//! ONLY`, which the router places on a replica. Every read inside the
//! transaction is forwarded normally while an order-independent checksum of
//! its reply rows plus the (affected rows, last insert id, warnings, error)
//! attributes is recorded together with a deep clone of the statement. If
//! the transaction commits without a write, the bet paid off and the
//! replica did all the work. The first write loses the bet: the shadow
//! transaction is rolled back and the recorded statements are replayed on
//! the primary with their checksums compared; any divergence means the
//! client saw rows that no longer exist upstream, so the session is closed
//! and the client retries. Counters: `success`, `rollback`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crc::{Crc, CRC_64_ECMA_182};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{DownstreamAction, FilterCtx, FilterModule, FilterSession, UpstreamVerdict};
use crate::core::buffer::BufChain;
use crate::core::classifier::{HeuristicInspector, SqlInspector, TypeMask};
use crate::core::protocol::codec;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::session::trackers::{MultiPartTracker, TrxTracker};
use crate::core::SqlGateError;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, Clone, Default)]
pub struct OptimisticTrxConfig {}

pub struct OptimisticTrxFilter {
    name: String,
    inspector: Arc<dyn SqlInspector>,
    success: Arc<AtomicU64>,
    rollback: Arc<AtomicU64>,
}

impl OptimisticTrxFilter {
    pub fn new(name: &str, _config: OptimisticTrxConfig) -> Self {
        OptimisticTrxFilter {
            name: name.to_string(),
            inspector: Arc::new(HeuristicInspector),
            success: Arc::new(AtomicU64::new(0)),
            rollback: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl FilterModule for OptimisticTrxFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, _ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        Ok(Box::new(OptimisticTrxSession {
            inspector: self.inspector.clone(),
            state: State::Idle,
            tracker: MultiPartTracker::default(),
            trx: TrxTracker::new(),
            actions: VecDeque::new(),
            checksums: VecDeque::new(),
            packets: VecDeque::new(),
            acc: 0,
            success: self.success.clone(),
            rollback: self.rollback.clone(),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "success": self.success.load(Ordering::Relaxed),
            "rollback": self.rollback.load(Ordering::Relaxed),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No transaction in progress.
    Idle,
    /// Collecting statements of an optimistic read-only transaction.
    Collect,
    /// The bet was lost; pass everything through until the transaction
    /// ends.
    Ignore,
}

/// What to do with the reply of each in-flight statement, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyAction {
    /// Forward to the client and record the checksum.
    Checksum,
    /// Absorb silently (injected START TRANSACTION / ROLLBACK).
    Discard,
    /// Absorb and compare against the recorded checksum of the same
    /// statement.
    Compare,
    /// Forward; on completion the transaction is over.
    Complete,
}

struct OptimisticTrxSession {
    inspector: Arc<dyn SqlInspector>,
    state: State,
    tracker: MultiPartTracker,
    trx: TrxTracker,
    actions: VecDeque<ReplyAction>,
    checksums: VecDeque<u64>,
    packets: VecDeque<BufChain>,
    /// Order-independent accumulator over the current reply's rows.
    acc: u64,
    success: Arc<AtomicU64>,
    rollback: Arc<AtomicU64>,
}

impl OptimisticTrxSession {
    fn type_mask(&self, packet: &BufChain) -> TypeMask {
        codec::sql_of(packet)
            .map(|sql| self.inspector.classify(&sql).type_mask)
            .unwrap_or_default()
    }

    fn finalize_checksum(&mut self, reply: &ReplyTracker) -> u64 {
        let mut attrs = Vec::with_capacity(26);
        attrs.extend_from_slice(&reply.affected_rows().to_le_bytes());
        attrs.extend_from_slice(&reply.last_insert_id().to_le_bytes());
        attrs.extend_from_slice(&reply.warnings().to_le_bytes());
        attrs.extend_from_slice(
            &reply
                .error()
                .map(|e| e.code)
                .unwrap_or_default()
                .to_le_bytes(),
        );
        std::mem::take(&mut self.acc) ^ CRC64.checksum(&attrs)
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.actions.clear();
        self.checksums.clear();
        self.packets.clear();
        self.acc = 0;
    }

    fn state_idle(&mut self, packet: BufChain, mask: TypeMask) -> DownstreamAction {
        if mask.contains(TypeMask::BEGIN_TRX) && !mask.contains(TypeMask::READ_WRITE_TRX) {
            debug!("starting optimistic transaction");
            self.state = State::Collect;
            self.trx.track(mask);
            self.packets.push_back(packet.deep_clone());
            self.actions.push_back(ReplyAction::Checksum);
            let header = codec::peek_header(&packet).map(|h| h.seq).unwrap_or(0);
            let mut shadow = codec::build_query("START TRANSACTION READ ONLY");
            let _ = codec::set_sequence(&mut shadow, header);
            return DownstreamAction::Forward(shadow);
        }
        self.trx.track(mask);
        DownstreamAction::Forward(packet)
    }

    fn state_collect(&mut self, packet: BufChain, mask: TypeMask) -> DownstreamAction {
        if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            // The bet paid off: the read-only shadow commits (or rolls
            // back) on the replica and the transaction never touched the
            // primary.
            self.trx.track(mask);
            self.actions.push_back(ReplyAction::Complete);
            return DownstreamAction::Forward(packet);
        }
        if is_write(mask) {
            info!("optimistic transaction hit a write, replaying on the primary");
            self.rollback.fetch_add(1, Ordering::Relaxed);
            self.state = State::Ignore;
            self.trx.track(mask);

            let mut out = Vec::with_capacity(self.packets.len() + 2);
            out.push(codec::build_query("ROLLBACK"));
            self.actions.push_back(ReplyAction::Discard);
            for stored in &self.packets {
                out.push(stored.shallow_clone());
                self.actions.push_back(ReplyAction::Compare);
            }
            out.push(packet);
            self.actions.push_back(ReplyAction::Complete);
            return DownstreamAction::ForwardMany(out);
        }
        // A read inside the optimistic transaction: collect and forward.
        self.trx.track(mask);
        self.packets.push_back(packet.deep_clone());
        self.actions.push_back(ReplyAction::Checksum);
        DownstreamAction::Forward(packet)
    }
}

fn is_write(mask: TypeMask) -> bool {
    mask.contains(TypeMask::WRITE)
}

#[async_trait(?Send)]
impl FilterSession for OptimisticTrxSession {
    async fn route_query(
        &mut self,
        packet: BufChain,
        _ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        self.tracker.track_query(&packet);
        if self.tracker.should_ignore() {
            return Ok(DownstreamAction::Forward(packet));
        }
        let Some(command) = codec::command_of(&packet) else {
            return Ok(DownstreamAction::Forward(packet));
        };
        if !command.will_respond() {
            return Ok(DownstreamAction::Forward(packet));
        }
        let mask = self.type_mask(&packet);
        let action = match self.state {
            State::Idle => self.state_idle(packet, mask),
            State::Collect => self.state_collect(packet, mask),
            State::Ignore => {
                self.trx.track(mask);
                if !self.trx.is_trx_active() {
                    self.reset();
                }
                DownstreamAction::Forward(packet)
            }
        };
        Ok(action)
    }

    async fn client_reply(
        &mut self,
        packet: BufChain,
        reply: &ReplyTracker,
        ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError> {
        let Some(action) = self.actions.front().copied() else {
            return Ok(UpstreamVerdict::forward(packet));
        };

        if reply.in_result_rows() {
            // Order-independent: XOR of per-row digests.
            self.acc ^= CRC64.checksum(&packet.to_vec());
        }
        let complete = reply.is_complete();
        let forward = matches!(action, ReplyAction::Checksum | ReplyAction::Complete);

        if complete {
            self.actions.pop_front();
            let checksum = self.finalize_checksum(reply);
            match action {
                ReplyAction::Checksum => self.checksums.push_back(checksum),
                ReplyAction::Discard => {}
                ReplyAction::Compare => {
                    let expected = self.checksums.pop_front().unwrap_or_default();
                    if expected != checksum {
                        info!(
                            session = ctx.session_id,
                            "optimistic replay diverged, closing session"
                        );
                        ctx.kill_session = true;
                        return Err(SqlGateError::ChecksumMismatch);
                    }
                }
                ReplyAction::Complete => {
                    if self.state == State::Collect {
                        self.success.fetch_add(1, Ordering::Relaxed);
                    }
                    self.reset();
                }
            }
        }

        if forward {
            Ok(UpstreamVerdict::forward(packet))
        } else {
            Ok(UpstreamVerdict::consume())
        }
    }
}
