// src/core/protocol/codec.rs

//! Packet framing: `[len:3 LE][seq:1][body]`.
//!
//! The codec peels complete packets off a `BufChain` without copying and
//! never renumbers sequences; packets synthesized by the session take the
//! next sequence the session owns.

use super::constants::{Command, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::core::buffer::BufChain;

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_len: usize,
    pub seq: u8,
}

impl PacketHeader {
    /// True when the payload is the continuation marker: the logical
    /// statement continues in the next packet.
    pub fn is_large(&self) -> bool {
        self.payload_len == MAX_PAYLOAD_LEN
    }
}

/// Peeks the header of the first packet in the chain, if enough bytes have
/// arrived.
pub fn peek_header(chain: &BufChain) -> Option<PacketHeader> {
    let mut hdr = [0u8; HEADER_LEN];
    if chain.copy_data(0, HEADER_LEN, &mut hdr) < HEADER_LEN {
        return None;
    }
    Some(PacketHeader {
        payload_len: u32::from_le_bytes([hdr[0], hdr[1], hdr[2], 0]) as usize,
        seq: hdr[3],
    })
}

/// Peels exactly one complete packet (header included) off the front of the
/// chain, leaving the remainder. Returns `None` while the packet is
/// incomplete.
pub fn next_packet(chain: &mut BufChain) -> Option<BufChain> {
    let header = peek_header(chain)?;
    let total = HEADER_LEN + header.payload_len;
    if chain.len() < total {
        return None;
    }
    Some(chain.split_front(total))
}

/// Builds a single packet from a sequence number and body.
pub fn build_packet(seq: u8, body: &[u8]) -> BufChain {
    debug_assert!(body.len() <= MAX_PAYLOAD_LEN);
    let mut data = Vec::with_capacity(HEADER_LEN + body.len());
    let len = body.len() as u32;
    data.extend_from_slice(&len.to_le_bytes()[..3]);
    data.push(seq);
    data.extend_from_slice(body);
    BufChain::from_vec(data)
}

/// Builds a `COM_QUERY` packet carrying the given SQL with sequence 0.
pub fn build_query(sql: &str) -> BufChain {
    let mut body = Vec::with_capacity(1 + sql.len());
    body.push(Command::Query.as_byte());
    body.extend_from_slice(sql.as_bytes());
    build_packet(0, &body)
}

/// Extracts the command byte of a complete client packet.
pub fn command_of(packet: &BufChain) -> Option<Command> {
    packet.byte_at(HEADER_LEN).and_then(Command::from_byte)
}

/// Extracts the SQL text of a `COM_QUERY` packet, if it is one and the
/// payload is valid UTF-8.
pub fn sql_of(packet: &BufChain) -> Option<String> {
    if command_of(packet) != Some(Command::Query) {
        return None;
    }
    let bytes: Vec<u8> = packet.bytes().skip(HEADER_LEN + 1).collect();
    String::from_utf8(bytes).ok()
}

/// Extracts the binary prepared-statement id of a `COM_STMT_*` packet.
pub fn stmt_id_of(packet: &BufChain) -> Option<u32> {
    let mut buf = [0u8; 4];
    if packet.copy_data(HEADER_LEN + 1, 4, &mut buf) < 4 {
        return None;
    }
    Some(u32::from_le_bytes(buf))
}

/// Rewrites the sequence byte of a packet in place.
pub fn set_sequence(packet: &mut BufChain, seq: u8) -> Result<(), crate::core::SqlGateError> {
    packet.ensure_unique();
    packet.write_at(3, seq)
}
