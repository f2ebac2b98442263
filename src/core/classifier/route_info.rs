// src/core/classifier/route_info.rs

//! The classifier's per-request verdict consumed by the router.

use std::collections::HashSet;

use bitflags::bitflags;

use crate::core::protocol::constants::Command;

bitflags! {
    /// Statement type bits. WRITE beats READ when both could apply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        const READ                = 1;
        const WRITE               = 1 << 1;
        const SESSION_WRITE       = 1 << 2;
        const USERVAR_READ        = 1 << 3;
        const USERVAR_WRITE       = 1 << 4;
        const SYSVAR_READ         = 1 << 5;
        const GSYSVAR_WRITE       = 1 << 6;
        const BEGIN_TRX           = 1 << 7;
        const COMMIT              = 1 << 8;
        const ROLLBACK            = 1 << 9;
        const ENABLE_AUTOCOMMIT   = 1 << 10;
        const DISABLE_AUTOCOMMIT  = 1 << 11;
        const READ_ONLY_TRX       = 1 << 12;
        const READ_WRITE_TRX      = 1 << 13;
        const PREPARE_STMT        = 1 << 14;
        const EXEC_STMT           = 1 << 15;
        const CREATE_TMP_TABLE    = 1 << 16;
        const LOAD_DATA_LOCAL     = 1 << 17;
        const NEXT_TRX            = 1 << 18;
    }
}

bitflags! {
    /// Routing target classes. Empty means undefined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetClass: u32 {
        const MASTER       = 1;
        const SLAVE        = 1 << 1;
        const NAMED_SERVER = 1 << 2;
        const ALL          = 1 << 3;
        const RLAG_MAX     = 1 << 4;
        const LAST_USED    = 1 << 5;
    }
}

/// States of a LOAD DATA LOCAL INFILE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    /// Not active.
    #[default]
    Inactive,
    /// The client is streaming data packets.
    Active,
    /// The current packet is the empty terminator.
    End,
}

/// The classifier's verdict for one client request.
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    target: TargetClass,
    named_target: Option<String>,
    max_rlag: Option<i64>,
    command: Option<Command>,
    type_mask: TypeMask,
    stmt_id: u32,
    load_data_state: LoadDataState,
    load_data_sent: u64,
    large_query: bool,
    next_large_query: bool,
    trx_is_read_only: bool,
    ps_continuation: bool,
    tmp_tables: HashSet<String>,
}

impl RouteInfo {
    /// Current routing target.
    pub fn target(&self) -> TargetClass {
        self.target
    }

    /// Named server a hint pinned the request to, when `NAMED_SERVER` is set.
    pub fn named_target(&self) -> Option<&str> {
        self.named_target.as_deref()
    }

    /// Replication-lag cap from a hint, when `RLAG_MAX` is set.
    pub fn max_rlag(&self) -> Option<i64> {
        self.max_rlag
    }

    pub fn command(&self) -> Option<Command> {
        self.command
    }

    pub fn type_mask(&self) -> TypeMask {
        self.type_mask
    }

    /// Prepared statement id of the request, 0 when not applicable.
    pub fn stmt_id(&self) -> u32 {
        self.stmt_id
    }

    /// Whether this packet is a continuation of a multi-packet query.
    pub fn large_query(&self) -> bool {
        self.large_query
    }

    /// Whether the packet after this one continues a multi-packet query.
    pub fn expecting_large_query(&self) -> bool {
        self.next_large_query
    }

    /// Whether the server will generate a response for this packet.
    pub fn expecting_response(&self) -> bool {
        self.load_data_state() == LoadDataState::Inactive
            && !self.large_query()
            && self.command.map(Command::will_respond).unwrap_or(false)
    }

    pub fn load_data_state(&self) -> LoadDataState {
        self.load_data_state
    }

    /// Whether a LOAD DATA LOCAL INFILE is in progress.
    pub fn loading_data(&self) -> bool {
        self.load_data_state != LoadDataState::Inactive
    }

    /// Bytes sent so far in the LOAD DATA stream.
    pub fn load_data_sent(&self) -> u64 {
        self.load_data_sent
    }

    /// True if no statement has modified data in the current transaction.
    pub fn is_trx_still_read_only(&self) -> bool {
        self.trx_is_read_only
    }

    /// Whether the current binary-protocol statement continues a previously
    /// executed one (all FETCHes; EXECUTEs without fresh type descriptors).
    pub fn is_ps_continuation(&self) -> bool {
        self.ps_continuation
    }

    pub fn have_tmp_tables(&self) -> bool {
        !self.tmp_tables.is_empty()
    }

    pub fn is_tmp_table(&self, table: &str) -> bool {
        self.tmp_tables.contains(table)
    }

    pub fn tmp_tables(&self) -> &HashSet<String> {
        &self.tmp_tables
    }

    // --- setters, used by the classifier ---

    pub(crate) fn set_command(&mut self, c: Option<Command>) {
        self.command = c;
    }

    pub(crate) fn set_target(&mut self, t: TargetClass) {
        self.target = t;
    }

    pub(crate) fn or_target(&mut self, t: TargetClass) {
        self.target |= t;
    }

    pub(crate) fn set_named_target(&mut self, name: Option<String>) {
        self.named_target = name;
    }

    pub(crate) fn set_max_rlag(&mut self, lag: Option<i64>) {
        self.max_rlag = lag;
    }

    pub(crate) fn set_type_mask(&mut self, t: TypeMask) {
        self.type_mask = t;
    }

    pub(crate) fn or_type_mask(&mut self, t: TypeMask) {
        self.type_mask |= t;
    }

    pub(crate) fn set_stmt_id(&mut self, id: u32) {
        self.stmt_id = id;
    }

    /// The value returned from `large_query()` must lag by one
    /// classification result: the first packet of a multi-packet statement
    /// reports false, the subsequent ones report true.
    pub(crate) fn set_large_query(&mut self, large: bool) {
        self.large_query = self.next_large_query;
        self.next_large_query = large;
    }

    pub(crate) fn set_load_data_state(&mut self, state: LoadDataState) {
        if state == LoadDataState::Active {
            self.load_data_sent = 0;
        }
        self.load_data_state = state;
    }

    pub(crate) fn append_load_data_sent(&mut self, n: u64) {
        self.load_data_sent += n;
    }

    pub(crate) fn set_trx_still_read_only(&mut self, value: bool) {
        self.trx_is_read_only = value;
    }

    pub(crate) fn set_ps_continuation(&mut self, value: bool) {
        self.ps_continuation = value;
    }

    pub(crate) fn add_tmp_table(&mut self, table: String) {
        self.tmp_tables.insert(table);
    }

    pub(crate) fn remove_tmp_table(&mut self, table: &str) {
        self.tmp_tables.remove(table);
    }

    pub(crate) fn clear_tmp_tables(&mut self) {
        self.tmp_tables.clear();
    }
}
