// src/core/protocol/mod.rs

//! MySQL/MariaDB-family wire protocol: framing codec, packet layer,
//! reply tracking and the optional proxy-protocol prelude.

pub mod codec;
pub mod constants;
pub mod packets;
pub mod proxy_header;
pub mod reply;

pub use codec::{build_packet, next_packet, peek_header, PacketHeader};
pub use constants::{Capabilities, Command, StatusFlags};
pub use reply::{ReplyEvent, ReplyTracker};
