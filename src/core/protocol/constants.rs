// src/core/protocol/constants.rs

//! Wire-level constants of the MySQL/MariaDB client protocol.

use bitflags::bitflags;
use strum_macros::Display;

/// Length of the `[len:3 LE][seq:1]` packet header.
pub const HEADER_LEN: usize = 4;

/// Maximum payload length of a single packet. A payload of exactly this
/// length means the statement continues in the next packet.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Length of the authentication scramble sent in the server handshake.
pub const SCRAMBLE_LEN: usize = 20;

/// Protocol version byte of the server handshake.
pub const PROTOCOL_VERSION: u8 = 10;

/// Marker byte of a LOCAL INFILE file-request reply.
pub const LOCAL_INFILE_MARKER: u8 = 0xFB;

/// Client commands in scope for the proxy.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    Statistics = 0x09,
    ProcessKill = 0x0C,
    Ping = 0x0E,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1A,
    SetOption = 0x1B,
    StmtFetch = 0x1C,
    ResetConnection = 0x1F,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Command> {
        let cmd = match byte {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x09 => Command::Statistics,
            0x0C => Command::ProcessKill,
            0x0E => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1A => Command::StmtReset,
            0x1B => Command::SetOption,
            0x1C => Command::StmtFetch,
            0x1F => Command::ResetConnection,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether the server generates a response packet for this command.
    pub fn will_respond(self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtSendLongData | Command::StmtClose
        )
    }
}

bitflags! {
    /// Client/server capability flags exchanged during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const LONG_PASSWORD     = 1;
        const FOUND_ROWS        = 1 << 1;
        const LONG_FLAG         = 1 << 2;
        const CONNECT_WITH_DB   = 1 << 3;
        const NO_SCHEMA         = 1 << 4;
        const COMPRESS          = 1 << 5;
        const LOCAL_FILES       = 1 << 7;
        const PROTOCOL_41       = 1 << 9;
        const INTERACTIVE       = 1 << 10;
        const SSL               = 1 << 11;
        const TRANSACTIONS      = 1 << 13;
        const SECURE_CONNECTION = 1 << 15;
        const MULTI_STATEMENTS  = 1 << 16;
        const MULTI_RESULTS     = 1 << 17;
        const PS_MULTI_RESULTS  = 1 << 18;
        const PLUGIN_AUTH       = 1 << 19;
        const CONNECT_ATTRS     = 1 << 20;
        const PLUGIN_AUTH_LENENC = 1 << 21;
        const SESSION_TRACK     = 1 << 23;
        const DEPRECATE_EOF     = 1 << 24;
    }
}

bitflags! {
    /// Server status flags carried in OK and EOF packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const IN_TRANS             = 1;
        const AUTOCOMMIT           = 1 << 1;
        const MORE_RESULTS_EXISTS  = 1 << 3;
        const NO_GOOD_INDEX_USED   = 1 << 4;
        const NO_INDEX_USED        = 1 << 5;
        const CURSOR_EXISTS        = 1 << 6;
        const LAST_ROW_SENT        = 1 << 7;
        const DB_DROPPED           = 1 << 8;
        const NO_BACKSLASH_ESCAPES = 1 << 9;
        const SESSION_STATE_CHANGED = 1 << 14;
    }
}

/// Binary protocol field type codes.
/// <https://mariadb.com/kb/en/result-set-packets/#field-types>
pub mod field_types {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// Vendor error codes surfaced by the proxy.
pub mod error_codes {
    /// Access denied for user.
    pub const ER_ACCESS_DENIED: u16 = 1045;
    /// Access denied to the requested database.
    pub const ER_DBACCESS_DENIED: u16 = 1044;
    /// Unknown database.
    pub const ER_BAD_DB: u16 = 1049;
    /// Authentication plugin cannot be loaded.
    pub const ER_PLUGIN_NOT_LOADED: u16 = 1524;
    /// Connection was killed.
    pub const ER_CONNECTION_KILLED: u16 = 1927;
    /// Client-side "can't connect to server" code, reused when the master
    /// is lost mid-transaction.
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
}

/// Session-state-change payload types inside an OK packet.
pub mod session_track {
    pub const SYSTEM_VARIABLES: u8 = 0;
    pub const SCHEMA: u8 = 1;
    pub const STATE_CHANGE: u8 = 2;
    pub const GTIDS: u8 = 3;
}
