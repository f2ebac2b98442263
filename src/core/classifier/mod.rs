// src/core/classifier/mod.rs

//! The per-session query classifier.
//!
//! Consulted on every complete client request (or the first segment of a
//! multi-packet one), it produces a fresh `RouteInfo` that drives the
//! router: command kind, type mask, target class, prepared-statement id,
//! LOAD DATA progress and temp-table awareness. SQL itself is not parsed
//! here; a pluggable `SqlInspector` oracle supplies statement semantics.

pub mod inspector;
pub mod ps;
pub mod route_info;

pub use inspector::{HeuristicInspector, SqlInfo, SqlInspector};
pub use ps::PsTracker;
pub use route_info::{LoadDataState, RouteInfo, TargetClass, TypeMask};

use std::sync::Arc;

use tracing::debug;

use crate::core::buffer::{BufChain, RoutingHint};
use crate::core::protocol::codec;
use crate::core::protocol::constants::{Command, MAX_PAYLOAD_LEN};
use crate::core::protocol::reply::ReplyTracker;
use crate::core::session::trackers::TrxTracker;

/// Classifier tunables, resolved from service configuration.
#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// Route reads inside an explicit read-only transaction to slaves.
    pub trx_read_only_to_slave: bool,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        ClassifierSettings {
            trx_read_only_to_slave: true,
        }
    }
}

/// Stateful per-session classifier.
pub struct QueryClassifier {
    inspector: Arc<dyn SqlInspector>,
    settings: ClassifierSettings,
    ps: PsTracker,
    trx: TrxTracker,
    route_info: RouteInfo,
    prev_route_info: Option<RouteInfo>,
}

impl QueryClassifier {
    pub fn new(inspector: Arc<dyn SqlInspector>, settings: ClassifierSettings) -> Self {
        QueryClassifier {
            inspector,
            settings,
            ps: PsTracker::new(),
            trx: TrxTracker::new(),
            route_info: RouteInfo::default(),
            prev_route_info: None,
        }
    }

    pub fn route_info(&self) -> &RouteInfo {
        &self.route_info
    }

    pub fn ps(&self) -> &PsTracker {
        &self.ps
    }

    pub fn ps_mut(&mut self) -> &mut PsTracker {
        &mut self.ps
    }

    pub fn trx(&self) -> &TrxTracker {
        &self.trx
    }

    /// Classifies one complete client packet. The previous `RouteInfo` is
    /// retained so the router may call `revert_update` exactly once if the
    /// request cannot be dispatched.
    pub fn update_route_info(&mut self, packet: &BufChain) -> &RouteInfo {
        self.prev_route_info = Some(self.route_info.clone());
        let payload_len = codec::peek_header(packet)
            .map(|h| h.payload_len)
            .unwrap_or(0);

        // A continuation of a previous multi-packet statement: forward to
        // the same target, do not reclassify.
        if self.route_info.expecting_large_query() {
            self.route_info.set_large_query(payload_len == MAX_PAYLOAD_LEN);
            self.route_info.set_target(TargetClass::LAST_USED);
            return &self.route_info;
        }

        if self.route_info.loading_data() {
            self.classify_load_data(packet, payload_len);
            return &self.route_info;
        }

        self.route_info.set_large_query(payload_len == MAX_PAYLOAD_LEN);

        let command = codec::command_of(packet);
        self.route_info.set_command(command);
        self.route_info.set_type_mask(TypeMask::empty());
        self.route_info.set_stmt_id(0);
        self.route_info.set_ps_continuation(false);
        self.route_info.set_target(TargetClass::empty());

        match command {
            Some(Command::Query) => self.classify_query(packet),
            Some(Command::StmtPrepare) => {
                self.route_info.or_type_mask(TypeMask::PREPARE_STMT | TypeMask::SESSION_WRITE);
                self.route_info.set_target(TargetClass::ALL);
                self.ps.track_query(packet);
            }
            Some(Command::StmtExecute) | Some(Command::StmtFetch) => {
                self.classify_binary_exec(packet, command == Some(Command::StmtFetch));
            }
            Some(Command::StmtClose) | Some(Command::StmtReset)
            | Some(Command::StmtSendLongData) => {
                if let Some(id) = codec::stmt_id_of(packet) {
                    self.route_info.set_stmt_id(id);
                }
                self.route_info.set_target(TargetClass::ALL);
                self.ps.track_query(packet);
            }
            Some(Command::InitDb) | Some(Command::ChangeUser) | Some(Command::ResetConnection)
            | Some(Command::SetOption) => {
                self.route_info.or_type_mask(TypeMask::SESSION_WRITE);
                self.route_info.set_target(TargetClass::ALL);
            }
            Some(Command::Quit) => {
                self.route_info.set_target(TargetClass::ALL);
            }
            Some(Command::Ping) | Some(Command::Statistics) | Some(Command::ProcessKill)
            | Some(Command::FieldList) | Some(Command::Sleep) => {
                self.route_info.set_target(TargetClass::MASTER);
            }
            None => {
                // Unknown command byte: play it safe, master only.
                self.route_info.set_target(TargetClass::MASTER);
            }
        }

        self.apply_hints(packet.hints());
        self.route_info
            .set_trx_still_read_only(self.trx.is_trx_read_only());
        &self.route_info
    }

    /// Restores the state prior to the last `update_route_info`. Effective
    /// exactly once.
    pub fn revert_update(&mut self) {
        if let Some(prev) = self.prev_route_info.take() {
            self.route_info = prev;
        }
    }

    /// Feeds the backend reply so that PREPARE-OK metadata and LOAD DATA
    /// completion are tracked.
    pub fn track_reply(&mut self, reply: &ReplyTracker) {
        self.ps.track_reply(reply);
        if reply.is_complete() && self.route_info.load_data_state() == LoadDataState::End {
            self.route_info.set_load_data_state(LoadDataState::Inactive);
        }
    }

    /// The master changed: temp tables living on the old master are gone.
    pub fn master_switchover(&mut self) {
        debug!("master switchover, clearing temporary table set");
        self.route_info.clear_tmp_tables();
    }

    fn classify_query(&mut self, packet: &BufChain) {
        let Some(sql) = codec::sql_of(packet) else {
            self.route_info.set_target(TargetClass::MASTER);
            return;
        };
        let info = self.inspector.classify(&sql);
        self.route_info.or_type_mask(info.type_mask);
        self.trx.track(info.type_mask);

        if let Some(table) = &info.created_tmp_table {
            self.route_info.add_tmp_table(table.clone());
        }
        for table in &info.dropped_tables {
            self.route_info.remove_tmp_table(table);
        }

        let reads_tmp_table = info
            .accessed_tables
            .iter()
            .any(|t| self.route_info.is_tmp_table(t));

        if info.type_mask.contains(TypeMask::LOAD_DATA_LOCAL) {
            self.route_info.set_load_data_state(LoadDataState::Active);
        }

        let target = self.query_target(&info, reads_tmp_table);
        self.route_info.set_target(target);
    }

    fn query_target(&self, info: &SqlInfo, reads_tmp_table: bool) -> TargetClass {
        let mask = info.type_mask;
        if mask.intersects(TypeMask::SESSION_WRITE | TypeMask::USERVAR_WRITE) {
            return TargetClass::ALL;
        }
        if mask.contains(TypeMask::BEGIN_TRX) {
            // A read-only transaction may open on a replica; everything
            // else starts on the master.
            return if self.settings.trx_read_only_to_slave
                && mask.contains(TypeMask::READ_ONLY_TRX)
            {
                TargetClass::SLAVE
            } else {
                TargetClass::MASTER
            };
        }
        if mask.contains(TypeMask::WRITE) || mask.contains(TypeMask::LOAD_DATA_LOCAL) {
            return TargetClass::MASTER;
        }
        if reads_tmp_table {
            return TargetClass::MASTER;
        }
        if self.trx.is_trx_active() {
            // Reads inside a read-only transaction may go to a slave; any
            // other transactional statement stays on the master.
            if self.settings.trx_read_only_to_slave
                && self.trx.is_trx_read_only()
                && mask.contains(TypeMask::READ)
            {
                return TargetClass::SLAVE;
            }
            return TargetClass::MASTER;
        }
        if mask.intersects(TypeMask::READ | TypeMask::SYSVAR_READ | TypeMask::USERVAR_READ) {
            return TargetClass::SLAVE;
        }
        TargetClass::MASTER
    }

    fn classify_binary_exec(&mut self, packet: &BufChain, is_fetch: bool) {
        self.route_info.or_type_mask(TypeMask::EXEC_STMT);
        if let Some(id) = codec::stmt_id_of(packet) {
            self.route_info.set_stmt_id(id);
        }
        // FETCH always continues a previous EXECUTE; an EXECUTE without
        // fresh type descriptors reuses the cached ones.
        let continuation = is_fetch || !self.ps.execute_carries_types(packet);
        self.route_info.set_ps_continuation(continuation);
        self.ps.track_query(packet);

        let stmt_id = self.route_info.stmt_id();
        let write = self
            .ps
            .prepared_sql(stmt_id)
            .map(|sql| self.inspector.classify(sql).type_mask.contains(TypeMask::WRITE))
            .unwrap_or(true);
        let target = if write || self.trx.is_trx_active() {
            TargetClass::MASTER
        } else if is_fetch || continuation {
            TargetClass::LAST_USED
        } else {
            TargetClass::SLAVE
        };
        self.route_info.set_target(target);
    }

    fn classify_load_data(&mut self, packet: &BufChain, payload_len: usize) {
        self.route_info.set_large_query(false);
        self.route_info.set_target(TargetClass::LAST_USED);
        self.route_info.append_load_data_sent(packet.len() as u64);
        if payload_len == 0 {
            // The empty packet terminates the stream.
            self.route_info.set_load_data_state(LoadDataState::End);
        }
    }

    fn apply_hints(&mut self, hints: &[RoutingHint]) {
        for hint in hints {
            match hint {
                RoutingHint::Master => {
                    self.route_info.set_target(TargetClass::MASTER);
                    return;
                }
                RoutingHint::Slave => {
                    // A write can never be forced onto a slave.
                    if !self.route_info.type_mask().contains(TypeMask::WRITE) {
                        self.route_info.set_target(TargetClass::SLAVE);
                        return;
                    }
                }
                RoutingHint::Named(name) => {
                    self.route_info.or_target(TargetClass::NAMED_SERVER);
                    self.route_info.set_named_target(Some(name.clone()));
                    return;
                }
                RoutingHint::MaxReplicationLag(lag) => {
                    self.route_info.or_target(TargetClass::RLAG_MAX);
                    self.route_info.set_max_rlag(Some(*lag));
                    return;
                }
                RoutingHint::LastUsed => {
                    self.route_info.set_target(TargetClass::LAST_USED);
                    return;
                }
            }
        }
    }
}
