// src/core/router/history.rs

//! Session-command history.
//!
//! Every session-affecting command (USE, SET, PREPARE, ...) is recorded so
//! that a backend added mid-session can be brought to the same state by
//! replaying the history in order before it serves queries. The first
//! backend's reply to each command defines the canonical outcome; a replay
//! whose outcome differs drops that backend. The history is bounded: once
//! the cap is exceeded, old entries are discarded and outcome verification
//! is disabled (logged once), because a partial replay can no longer prove
//! equivalence.

use std::collections::VecDeque;

use crc::{Crc, CRC_64_ECMA_182};
use tracing::warn;

use crate::core::buffer::BufChain;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// One recorded session command.
#[derive(Debug)]
pub struct SessionCommand {
    pub id: u64,
    pub packet: BufChain,
    /// CRC of the canonical (first) reply; `None` until it completes.
    pub checksum: Option<u64>,
}

/// The bounded per-session history buffer.
#[derive(Debug, Default)]
pub struct SessionCommandHistory {
    commands: VecDeque<SessionCommand>,
    cap: usize,
    next_id: u64,
    overflowed: bool,
}

impl SessionCommandHistory {
    pub fn new(cap: usize) -> Self {
        SessionCommandHistory {
            commands: VecDeque::new(),
            cap,
            next_id: 1,
            overflowed: false,
        }
    }

    /// Records a command (stored as a deep clone, detached from the I/O
    /// path) and returns its id.
    pub fn record(&mut self, packet: &BufChain) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.commands.push_back(SessionCommand {
            id,
            packet: packet.deep_clone(),
            checksum: None,
        });
        if self.cap > 0 && self.commands.len() > self.cap {
            self.commands.pop_front();
            if !self.overflowed {
                self.overflowed = true;
                warn!(
                    cap = self.cap,
                    "session command history overflowed; replay verification disabled"
                );
            }
        }
        id
    }

    /// Stores the canonical reply checksum of a command.
    pub fn set_checksum(&mut self, id: u64, checksum: u64) {
        if let Some(cmd) = self.commands.iter_mut().find(|c| c.id == id) {
            cmd.checksum = Some(checksum);
        }
    }

    /// Appends a continuation segment of a multi-packet command so the
    /// recorded statement is complete when it is later replayed.
    pub fn append_continuation(&mut self, id: u64, packet: &BufChain) {
        if let Some(cmd) = self.commands.iter_mut().find(|c| c.id == id) {
            cmd.packet.append(packet.deep_clone());
        }
    }

    /// Whether replay outcomes can still be verified.
    pub fn verifiable(&self) -> bool {
        !self.overflowed
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionCommand> {
        self.commands.iter()
    }

    /// The command at a replay position.
    pub fn at(&self, pos: usize) -> Option<&SessionCommand> {
        self.commands.get(pos)
    }

    /// Checksums a complete reply for canonical/replay comparison.
    pub fn reply_checksum(reply_bytes: &[u8]) -> u64 {
        CRC64.checksum(reply_bytes)
    }
}
