// src/core/protocol/packets.rs

//! Parsing and building of the protocol packets the proxy inspects:
//! handshakes, OK/ERR/EOF and COM_CHANGE_USER. All parse functions take the
//! packet body, i.e. the payload after the 4-byte framing header.

use super::constants::{
    session_track, Capabilities, StatusFlags, PROTOCOL_VERSION, SCRAMBLE_LEN,
};
use crate::core::SqlGateError;

// --- length-encoded primitives ---

/// Reads a length-encoded integer, advancing `pos`. Returns `None` for the
/// 0xFB NULL marker.
pub fn read_lenenc_int(data: &[u8], pos: &mut usize) -> Result<Option<u64>, SqlGateError> {
    let first = *data.get(*pos).ok_or(SqlGateError::Underflow)?;
    *pos += 1;
    let value = match first {
        0xFB => return Ok(None),
        0xFC => {
            let b = data.get(*pos..*pos + 2).ok_or(SqlGateError::Underflow)?;
            *pos += 2;
            u64::from(u16::from_le_bytes([b[0], b[1]]))
        }
        0xFD => {
            let b = data.get(*pos..*pos + 3).ok_or(SqlGateError::Underflow)?;
            *pos += 3;
            u64::from(u32::from_le_bytes([b[0], b[1], b[2], 0]))
        }
        0xFE => {
            let b = data.get(*pos..*pos + 8).ok_or(SqlGateError::Underflow)?;
            *pos += 8;
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }
        n => u64::from(n),
    };
    Ok(Some(value))
}

/// Appends a length-encoded integer.
pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFA => out.push(value as u8),
        0xFB..=0xFFFF => {
            out.push(0xFC);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFF_FFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xFE);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Reads a length-encoded byte string, advancing `pos`.
pub fn read_lenenc_bytes<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], SqlGateError> {
    let len = read_lenenc_int(data, pos)?.unwrap_or(0) as usize;
    let bytes = data.get(*pos..*pos + len).ok_or(SqlGateError::Underflow)?;
    *pos += len;
    Ok(bytes)
}

/// Reads a NUL-terminated string, advancing `pos` past the terminator.
pub fn read_null_str<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], SqlGateError> {
    let rest = data.get(*pos..).ok_or(SqlGateError::Underflow)?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(SqlGateError::Underflow)?;
    let s = &rest[..nul];
    *pos += nul + 1;
    Ok(s)
}

// --- OK / ERR / EOF ---

/// A parsed OK packet (`0x00`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: StatusFlags,
    pub warnings: u16,
    pub info: String,
    /// GTID position carried in the session-state-change block, if any.
    pub gtid: Option<String>,
    /// New default schema from a session-state SCHEMA entry, if any.
    pub schema: Option<String>,
}

impl OkPacket {
    pub fn parse(body: &[u8], caps: Capabilities) -> Result<OkPacket, SqlGateError> {
        if body.first() != Some(&0x00) && body.first() != Some(&0xFE) {
            return Err(SqlGateError::Protocol("not an OK packet".into()));
        }
        let mut pos = 1;
        let affected_rows = read_lenenc_int(body, &mut pos)?.unwrap_or(0);
        let last_insert_id = read_lenenc_int(body, &mut pos)?.unwrap_or(0);
        let raw = body.get(pos..pos + 4).ok_or(SqlGateError::Underflow)?;
        let status = StatusFlags::from_bits_truncate(u16::from_le_bytes([raw[0], raw[1]]));
        let warnings = u16::from_le_bytes([raw[2], raw[3]]);
        pos += 4;

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            status,
            warnings,
            ..Default::default()
        };

        if caps.contains(Capabilities::SESSION_TRACK) && pos < body.len() {
            ok.info = String::from_utf8_lossy(read_lenenc_bytes(body, &mut pos)?).into_owned();
            if status.contains(StatusFlags::SESSION_STATE_CHANGED) && pos < body.len() {
                let block = read_lenenc_bytes(body, &mut pos)?;
                ok.parse_session_state(block)?;
            }
        } else if pos < body.len() {
            ok.info = String::from_utf8_lossy(&body[pos..]).into_owned();
        }
        Ok(ok)
    }

    fn parse_session_state(&mut self, block: &[u8]) -> Result<(), SqlGateError> {
        let mut pos = 0;
        while pos < block.len() {
            let entry_type = block[pos];
            pos += 1;
            let data = read_lenenc_bytes(block, &mut pos)?;
            match entry_type {
                session_track::GTIDS => {
                    // A one-byte specification flag precedes the value.
                    let mut p = if data.first() == Some(&0) { 1 } else { 0 };
                    let gtid = read_lenenc_bytes(data, &mut p)?;
                    self.gtid = Some(String::from_utf8_lossy(gtid).into_owned());
                }
                session_track::SCHEMA => {
                    let mut p = 0;
                    let schema = read_lenenc_bytes(data, &mut p)?;
                    self.schema = Some(String::from_utf8_lossy(schema).into_owned());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Builds a minimal OK body (no session tracking).
    pub fn build(affected_rows: u64, last_insert_id: u64, status: StatusFlags) -> Vec<u8> {
        let mut body = vec![0x00];
        write_lenenc_int(&mut body, affected_rows);
        write_lenenc_int(&mut body, last_insert_id);
        body.extend_from_slice(&status.bits().to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body
    }
}

/// A parsed ERR packet (`0xFF`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(body: &[u8]) -> Result<ErrPacket, SqlGateError> {
        if body.first() != Some(&0xFF) {
            return Err(SqlGateError::Protocol("not an ERR packet".into()));
        }
        let raw = body.get(1..3).ok_or(SqlGateError::Underflow)?;
        let code = u16::from_le_bytes([raw[0], raw[1]]);
        let mut pos = 3;
        let sqlstate = if body.get(pos) == Some(&b'#') {
            let s = body.get(pos + 1..pos + 6).ok_or(SqlGateError::Underflow)?;
            pos += 6;
            String::from_utf8_lossy(s).into_owned()
        } else {
            String::from("HY000")
        };
        let message = String::from_utf8_lossy(body.get(pos..).unwrap_or(&[])).into_owned();
        Ok(ErrPacket {
            code,
            sqlstate,
            message,
        })
    }

    pub fn build(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
        let mut body = vec![0xFF];
        body.extend_from_slice(&code.to_le_bytes());
        body.push(b'#');
        body.extend_from_slice(&sqlstate.as_bytes()[..5.min(sqlstate.len())]);
        while body.len() < 9 {
            body.push(b'0');
        }
        body.extend_from_slice(message.as_bytes());
        body
    }
}

/// A parsed EOF packet (`0xFE`, payload shorter than 9 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: StatusFlags,
}

impl EofPacket {
    pub fn parse(body: &[u8]) -> Result<EofPacket, SqlGateError> {
        if body.first() != Some(&0xFE) || body.len() >= 9 {
            return Err(SqlGateError::Protocol("not an EOF packet".into()));
        }
        let warnings = body
            .get(1..3)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .unwrap_or(0);
        let status = body
            .get(3..5)
            .map(|b| StatusFlags::from_bits_truncate(u16::from_le_bytes([b[0], b[1]])))
            .unwrap_or_default();
        Ok(EofPacket { warnings, status })
    }

    /// True when the body looks like an EOF rather than a row whose first
    /// length-encoded value happens to start with 0xFE.
    pub fn is_eof(body: &[u8]) -> bool {
        body.first() == Some(&0xFE) && body.len() < 9
    }
}

// --- handshakes ---

/// The server greeting (protocol version 10).
#[derive(Debug, Clone)]
pub struct Handshake {
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: Vec<u8>,
    pub capabilities: Capabilities,
    pub charset: u8,
    pub status: StatusFlags,
    pub auth_plugin: String,
}

impl Handshake {
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        body.push(PROTOCOL_VERSION);
        body.extend_from_slice(self.server_version.as_bytes());
        body.push(0);
        body.extend_from_slice(&self.connection_id.to_le_bytes());
        body.extend_from_slice(&self.scramble[..8]);
        body.push(0);
        let caps = self.capabilities.bits();
        body.extend_from_slice(&(caps as u16).to_le_bytes());
        body.push(self.charset);
        body.extend_from_slice(&self.status.bits().to_le_bytes());
        body.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        body.push((self.scramble.len() + 1) as u8);
        body.extend_from_slice(&[0u8; 10]);
        body.extend_from_slice(&self.scramble[8..]);
        body.push(0);
        if self.capabilities.contains(Capabilities::PLUGIN_AUTH) {
            body.extend_from_slice(self.auth_plugin.as_bytes());
            body.push(0);
        }
        body
    }

    pub fn parse(body: &[u8]) -> Result<Handshake, SqlGateError> {
        if body.first() != Some(&PROTOCOL_VERSION) {
            return Err(SqlGateError::Protocol(format!(
                "unsupported handshake protocol version {:?}",
                body.first()
            )));
        }
        let mut pos = 1;
        let server_version = String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned();
        let raw = body.get(pos..pos + 4).ok_or(SqlGateError::Underflow)?;
        let connection_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        pos += 4;
        let mut scramble = body
            .get(pos..pos + 8)
            .ok_or(SqlGateError::Underflow)?
            .to_vec();
        pos += 9; // 8 scramble bytes + filler
        let low = body.get(pos..pos + 2).ok_or(SqlGateError::Underflow)?;
        let caps_low = u16::from_le_bytes([low[0], low[1]]);
        pos += 2;
        let charset = *body.get(pos).ok_or(SqlGateError::Underflow)?;
        pos += 1;
        let st = body.get(pos..pos + 2).ok_or(SqlGateError::Underflow)?;
        let status = StatusFlags::from_bits_truncate(u16::from_le_bytes([st[0], st[1]]));
        pos += 2;
        let high = body.get(pos..pos + 2).ok_or(SqlGateError::Underflow)?;
        let caps_high = u16::from_le_bytes([high[0], high[1]]);
        pos += 2;
        let capabilities =
            Capabilities::from_bits_truncate(u32::from(caps_low) | (u32::from(caps_high) << 16));
        let scramble_len = *body.get(pos).ok_or(SqlGateError::Underflow)? as usize;
        pos += 1 + 10; // length byte + reserved
        if capabilities.contains(Capabilities::SECURE_CONNECTION) {
            let part2_len = scramble_len.saturating_sub(9).max(12);
            let part2 = body
                .get(pos..pos + part2_len)
                .ok_or(SqlGateError::Underflow)?;
            scramble.extend_from_slice(part2);
            pos += part2_len + 1; // trailing NUL
        }
        let auth_plugin = if capabilities.contains(Capabilities::PLUGIN_AUTH) {
            String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned()
        } else {
            String::from("mysql_native_password")
        };
        Ok(Handshake {
            server_version,
            connection_id,
            scramble,
            capabilities,
            charset,
            status,
            auth_plugin,
        })
    }
}

/// The client's handshake response (protocol 4.1 layout).
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub capabilities: Capabilities,
    pub max_packet: u32,
    pub charset: u8,
    pub user: String,
    pub auth_response: Vec<u8>,
    pub db: Option<String>,
    pub plugin: Option<String>,
    pub attrs: Vec<(String, String)>,
}

impl HandshakeResponse {
    /// True when the body is only an SSLRequest: the 32-byte prefix with the
    /// SSL capability set and no user yet.
    pub fn is_ssl_request(body: &[u8]) -> bool {
        if body.len() != 32 {
            return false;
        }
        let caps = Capabilities::from_bits_truncate(u32::from_le_bytes([
            body[0], body[1], body[2], body[3],
        ]));
        caps.contains(Capabilities::SSL)
    }

    pub fn parse(body: &[u8]) -> Result<HandshakeResponse, SqlGateError> {
        let raw = body.get(..9).ok_or(SqlGateError::Underflow)?;
        let capabilities =
            Capabilities::from_bits_truncate(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        if !capabilities.contains(Capabilities::PROTOCOL_41) {
            return Err(SqlGateError::UnsupportedCapability(
                "pre-4.1 handshake".into(),
            ));
        }
        let max_packet = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let charset = raw[8];
        let mut pos = 32; // 9 parsed + 23 reserved
        let user = String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned();

        let auth_response = if capabilities.contains(Capabilities::PLUGIN_AUTH_LENENC) {
            read_lenenc_bytes(body, &mut pos)?.to_vec()
        } else if capabilities.contains(Capabilities::SECURE_CONNECTION) {
            let len = *body.get(pos).ok_or(SqlGateError::Underflow)? as usize;
            pos += 1;
            let bytes = body.get(pos..pos + len).ok_or(SqlGateError::Underflow)?;
            pos += len;
            bytes.to_vec()
        } else {
            read_null_str(body, &mut pos)?.to_vec()
        };

        let db = if capabilities.contains(Capabilities::CONNECT_WITH_DB) && pos < body.len() {
            Some(String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned())
        } else {
            None
        };
        let plugin = if capabilities.contains(Capabilities::PLUGIN_AUTH) && pos < body.len() {
            Some(String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned())
        } else {
            None
        };
        let mut attrs = Vec::new();
        if capabilities.contains(Capabilities::CONNECT_ATTRS) && pos < body.len() {
            let block = read_lenenc_bytes(body, &mut pos)?;
            let mut p = 0;
            while p < block.len() {
                let key = String::from_utf8_lossy(read_lenenc_bytes(block, &mut p)?).into_owned();
                let value = String::from_utf8_lossy(read_lenenc_bytes(block, &mut p)?).into_owned();
                attrs.push((key, value));
            }
        }
        Ok(HandshakeResponse {
            capabilities,
            max_packet,
            charset,
            user,
            auth_response,
            db,
            plugin,
            attrs,
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(&self.capabilities.bits().to_le_bytes());
        body.extend_from_slice(&self.max_packet.to_le_bytes());
        body.push(self.charset);
        body.extend_from_slice(&[0u8; 23]);
        body.extend_from_slice(self.user.as_bytes());
        body.push(0);
        if self.capabilities.contains(Capabilities::PLUGIN_AUTH_LENENC) {
            write_lenenc_int(&mut body, self.auth_response.len() as u64);
            body.extend_from_slice(&self.auth_response);
        } else if self.capabilities.contains(Capabilities::SECURE_CONNECTION) {
            body.push(self.auth_response.len() as u8);
            body.extend_from_slice(&self.auth_response);
        } else {
            body.extend_from_slice(&self.auth_response);
            body.push(0);
        }
        if let Some(db) = &self.db {
            body.extend_from_slice(db.as_bytes());
            body.push(0);
        }
        if let Some(plugin) = &self.plugin {
            body.extend_from_slice(plugin.as_bytes());
            body.push(0);
        }
        body
    }
}

/// A parsed COM_CHANGE_USER payload.
#[derive(Debug, Clone)]
pub struct ChangeUser {
    pub user: String,
    pub auth_response: Vec<u8>,
    pub db: Option<String>,
    pub charset: u8,
    pub plugin: Option<String>,
}

impl ChangeUser {
    pub fn parse(body: &[u8], caps: Capabilities) -> Result<ChangeUser, SqlGateError> {
        let mut pos = 1; // command byte
        let user = String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned();
        let auth_response = if caps.contains(Capabilities::SECURE_CONNECTION) {
            let len = *body.get(pos).ok_or(SqlGateError::Underflow)? as usize;
            pos += 1;
            let bytes = body.get(pos..pos + len).ok_or(SqlGateError::Underflow)?;
            pos += len;
            bytes.to_vec()
        } else {
            read_null_str(body, &mut pos)?.to_vec()
        };
        let db_raw = read_null_str(body, &mut pos)?;
        let db = if db_raw.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(db_raw).into_owned())
        };
        let charset = if pos + 1 < body.len() {
            let c = u16::from_le_bytes([body[pos], body[pos + 1]]);
            pos += 2;
            c as u8
        } else {
            0
        };
        let plugin = if caps.contains(Capabilities::PLUGIN_AUTH) && pos < body.len() {
            Some(String::from_utf8_lossy(read_null_str(body, &mut pos)?).into_owned())
        } else {
            None
        };
        Ok(ChangeUser {
            user,
            auth_response,
            db,
            charset,
            plugin,
        })
    }
}

/// Scramble helper: length guard used by handshake builders.
pub fn default_scramble() -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    // Printable ASCII, excluding NUL and '$', as servers do.
    (0..SCRAMBLE_LEN)
        .map(|_| rng.gen_range(0x21u8..=0x7Eu8))
        .collect()
}
