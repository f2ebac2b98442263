// src/core/session/trackers.rs

//! Small protocol trackers shared by the session, the classifier and
//! filters: multi-packet statements, transaction state and pending
//! session-affecting changes.

use crate::core::buffer::BufChain;
use crate::core::classifier::TypeMask;
use crate::core::protocol::codec;
use crate::core::protocol::constants::MAX_PAYLOAD_LEN;

/// Tracks whether the current client packet is a continuation of a
/// multi-packet statement. Continuations must not be re-classified or
/// re-routed; `should_ignore()` is true for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiPartTracker {
    is_continuation: bool,
    next_is_continuation: bool,
}

impl MultiPartTracker {
    pub fn track_query(&mut self, packet: &BufChain) {
        self.is_continuation = self.next_is_continuation;
        let payload_len = codec::peek_header(packet)
            .map(|h| h.payload_len)
            .unwrap_or(0);
        self.next_is_continuation = payload_len == MAX_PAYLOAD_LEN;
    }

    /// True when the packet just tracked is mid-statement.
    pub fn should_ignore(&self) -> bool {
        self.is_continuation
    }
}

/// Transaction state derived from classified type masks.
#[derive(Debug, Clone, Copy)]
pub struct TrxTracker {
    autocommit: bool,
    explicit_trx: bool,
    implicit_trx: bool,
    read_only: bool,
}

impl Default for TrxTracker {
    fn default() -> Self {
        TrxTracker {
            autocommit: true,
            explicit_trx: false,
            implicit_trx: false,
            read_only: true,
        }
    }
}

impl TrxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the type mask of a classified statement.
    pub fn track(&mut self, mask: TypeMask) {
        if mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            self.implicit_trx = false;
        } else if mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
        }

        if mask.contains(TypeMask::BEGIN_TRX) {
            self.explicit_trx = true;
            self.read_only = !mask.contains(TypeMask::READ_WRITE_TRX);
        } else if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            self.explicit_trx = false;
            self.implicit_trx = false;
            self.read_only = true;
        } else if self.is_trx_active() || !self.autocommit {
            if !self.autocommit {
                self.implicit_trx = true;
            }
            if mask.contains(TypeMask::WRITE) {
                self.read_only = false;
            }
        }
    }

    /// True if the next statement would start a transaction.
    pub fn is_trx_starting(&self, mask: TypeMask) -> bool {
        mask.contains(TypeMask::BEGIN_TRX) || (!self.autocommit && !self.is_trx_active())
    }

    pub fn is_trx_active(&self) -> bool {
        self.explicit_trx || self.implicit_trx
    }

    /// True while no write has executed in the current transaction.
    pub fn is_trx_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }
}

/// A session-affecting command whose backend response is pending. The value
/// is committed into the session only when the backend confirms with an OK.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionChange {
    #[default]
    None,
    Db(String),
    Role(String),
    User(String),
}

/// Tracks at most one pending session change at a time.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    pending: SessionChange,
}

impl ChangeTracker {
    pub fn set_pending(&mut self, change: SessionChange) {
        self.pending = change;
    }

    pub fn pending(&self) -> &SessionChange {
        &self.pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending != SessionChange::None
    }

    /// The backend confirmed: hand the change to the caller to apply.
    pub fn commit(&mut self) -> SessionChange {
        std::mem::take(&mut self.pending)
    }

    /// The backend rejected: forget the change.
    pub fn discard(&mut self) {
        self.pending = SessionChange::None;
    }
}
