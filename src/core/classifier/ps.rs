// src/core/classifier/ps.rs

//! Prepared-statement tracking.
//!
//! Tracks the lifecycle of binary-protocol statements: PREPARE stashes the
//! SQL, the PREPARE-OK reply records the id and placeholder offsets, EXECUTE
//! parameters are decoded to bit-faithful SQL text (the first EXECUTE's type
//! descriptors are cached so descriptor-less executions can still be
//! decoded), STMT_SEND_LONG_DATA accumulates per-parameter data, RESET
//! clears it and CLOSE removes the entry.

use std::collections::{HashMap, VecDeque};

use tracing::error;

use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::constants::{field_types, Command, HEADER_LEN};
use crate::core::protocol::packets::read_lenenc_int;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::SqlGateError;

/// A recorded prepared statement.
#[derive(Debug, Clone)]
pub struct Prepare {
    pub sql: String,
    pub param_offsets: Vec<usize>,
    pub param_count: u16,
    /// `(type, unsigned)` pairs cached from the first EXECUTE that carried
    /// descriptors.
    type_cache: Option<Vec<(u8, bool)>>,
}

/// Per-session prepared-statement map.
#[derive(Debug, Default)]
pub struct PsTracker {
    /// PREPAREs awaiting their reply, oldest first. Statements are stored
    /// optimistically here and only promoted into the map on success, so a
    /// client repeatedly sending failing prepares cannot grow the map.
    queue: VecDeque<String>,
    ps: HashMap<u32, Prepare>,
    long_data: HashMap<(u32, u16), Vec<u8>>,
}

impl PsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes one client request.
    pub fn track_query(&mut self, packet: &BufChain) {
        match codec::command_of(packet) {
            Some(Command::StmtPrepare) => {
                let bytes: Vec<u8> = packet.bytes().skip(HEADER_LEN + 1).collect();
                self.queue
                    .push_back(String::from_utf8_lossy(&bytes).into_owned());
            }
            Some(Command::StmtClose) => {
                if let Some(id) = codec::stmt_id_of(packet) {
                    self.ps.remove(&id);
                    self.long_data.retain(|(ps_id, _), _| *ps_id != id);
                }
            }
            Some(Command::StmtReset) => {
                if let Some(id) = codec::stmt_id_of(packet) {
                    self.long_data.retain(|(ps_id, _), _| *ps_id != id);
                }
            }
            Some(Command::StmtSendLongData) => {
                let body = packet.to_vec().split_off(HEADER_LEN);
                if body.len() >= 7 {
                    let id = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
                    let param = u16::from_le_bytes([body[5], body[6]]);
                    self.long_data
                        .entry((id, param))
                        .or_default()
                        .extend_from_slice(&body[7..]);
                }
            }
            _ => {}
        }
    }

    /// Observes a complete backend reply: a successful PREPARE-OK promotes
    /// the oldest queued SQL into the map.
    pub fn track_reply(&mut self, reply: &ReplyTracker) {
        if !reply.is_complete() || reply.command() != Some(Command::StmtPrepare) {
            return;
        }
        let Some(sql) = self.queue.pop_front() else {
            return;
        };
        if reply.error().is_some() {
            return;
        }
        let param_offsets = find_placeholders(&sql);
        if param_offsets.len() != reply.param_count() as usize {
            error!(
                "placeholder count in '{}' was calculated as {} but the server reports it as {}",
                sql,
                param_offsets.len(),
                reply.param_count()
            );
            return;
        }
        self.ps.insert(
            reply.ps_id(),
            Prepare {
                sql,
                param_offsets,
                param_count: reply.param_count(),
                type_cache: None,
            },
        );
    }

    pub fn prepared_sql(&self, id: u32) -> Option<&str> {
        self.ps.get(&id).map(|p| p.sql.as_str())
    }

    pub fn len(&self) -> usize {
        self.ps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ps.is_empty()
    }

    /// Whether a COM_STMT_EXECUTE packet carries fresh type descriptors.
    pub fn execute_carries_types(&self, packet: &BufChain) -> bool {
        let Some(id) = codec::stmt_id_of(packet) else {
            return false;
        };
        let Some(prep) = self.ps.get(&id) else {
            return false;
        };
        if prep.param_count == 0 {
            return false;
        }
        let body = packet.to_vec().split_off(HEADER_LEN);
        let bitmap_len = (prep.param_count as usize + 7) / 8;
        body.get(10 + bitmap_len) == Some(&1)
    }

    /// Renders a client request to SQL text: COM_QUERY payloads verbatim,
    /// COM_STMT_EXECUTE via placeholder substitution.
    pub fn to_sql(&mut self, packet: &BufChain) -> Option<String> {
        match codec::command_of(packet) {
            Some(Command::Query) => codec::sql_of(packet),
            Some(Command::StmtExecute) => {
                let (sql, args) = self.get_args(packet)?;
                Some(args_to_sql(&sql, &args))
            }
            _ => None,
        }
    }

    /// Returns the canonical SQL plus the decoded argument texts of a
    /// COM_STMT_EXECUTE, caching type descriptors on first sight.
    pub fn get_args(&mut self, packet: &BufChain) -> Option<(PreparedRef, Vec<String>)> {
        let id = codec::stmt_id_of(packet)?;
        let body = packet.to_vec().split_off(HEADER_LEN);
        let prep = self.ps.get_mut(&id)?;
        match convert_params_to_text(prep, &self.long_data, id, &body) {
            Ok(args) => Some((
                PreparedRef {
                    sql: prep.sql.clone(),
                    param_offsets: prep.param_offsets.clone(),
                },
                args,
            )),
            Err(e) => {
                error!("failed to decode parameters of statement {id}: {e}");
                None
            }
        }
    }
}

/// A detached view of a prepared statement used for rendering.
#[derive(Debug, Clone)]
pub struct PreparedRef {
    pub sql: String,
    pub param_offsets: Vec<usize>,
}

impl std::ops::Deref for PreparedRef {
    type Target = str;
    fn deref(&self) -> &str {
        &self.sql
    }
}

/// Substitutes each `?` at the recorded offsets, in order, with the decoded
/// argument text.
pub fn args_to_sql(prep: &PreparedRef, args: &[String]) -> String {
    let mut out = String::with_capacity(prep.sql.len() + args.iter().map(String::len).sum::<usize>());
    let mut last = 0;
    for (offset, arg) in prep.param_offsets.iter().zip(args) {
        out.push_str(&prep.sql[last..*offset]);
        out.push_str(arg);
        last = offset + 1;
    }
    out.push_str(&prep.sql[last..]);
    out
}

/// Finds `?` placeholders outside string literals, identifier quoting and
/// comments.
pub fn find_placeholders(sql: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut offsets = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'?' => offsets.push(i),
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 1;
                    } else if bytes[i] == quote {
                        break;
                    }
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_some_and(|c| c.is_ascii_whitespace()) =>
            {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    offsets
}

fn convert_params_to_text(
    prep: &mut Prepare,
    long_data: &HashMap<(u32, u16), Vec<u8>>,
    id: u32,
    body: &[u8],
) -> Result<Vec<String>, SqlGateError> {
    let n = prep.param_count as usize;
    if n == 0 {
        return Ok(Vec::new());
    }
    let bitmap_len = (n + 7) / 8;
    let bitmap = body
        .get(10..10 + bitmap_len)
        .ok_or(SqlGateError::Underflow)?;
    let bound_flag = *body.get(10 + bitmap_len).ok_or(SqlGateError::Underflow)?;
    let mut pos = 10 + bitmap_len + 1;

    if bound_flag == 1 {
        let mut types = Vec::with_capacity(n);
        for _ in 0..n {
            let t = body.get(pos..pos + 2).ok_or(SqlGateError::Underflow)?;
            types.push((t[0], t[1] & 0x80 != 0));
            pos += 2;
        }
        prep.type_cache = Some(types);
    }

    let types = prep
        .type_cache
        .as_ref()
        .ok_or_else(|| SqlGateError::Protocol("execute without cached parameter types".into()))?;

    let mut args = Vec::with_capacity(n);
    for (param, &(ty, unsigned)) in types.iter().enumerate() {
        if bitmap[param / 8] & (1 << (param % 8)) != 0 {
            args.push("NULL".to_string());
            continue;
        }
        if let Some(data) = long_data.get(&(id, param as u16)) {
            args.push(quote_bytes(data));
            continue;
        }
        args.push(binary_to_text(body, &mut pos, ty, unsigned)?);
    }
    Ok(args)
}

// --- binary value rendering ---
// Formats must be bit-faithful; see the binary row encoding of the
// result-set protocol.

fn take<'a>(body: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], SqlGateError> {
    let bytes = body.get(*pos..*pos + n).ok_or(SqlGateError::Underflow)?;
    *pos += n;
    Ok(bytes)
}

fn binary_to_text(
    body: &[u8],
    pos: &mut usize,
    ty: u8,
    unsigned: bool,
) -> Result<String, SqlGateError> {
    use field_types as ft;
    let mut itoa_buf = itoa::Buffer::new();
    let text = match ty {
        ft::DOUBLE => {
            let b = take(body, pos, 8)?;
            let v = f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            ryu::Buffer::new().format(v).to_string()
        }
        ft::FLOAT => {
            let b = take(body, pos, 4)?;
            let v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            ryu::Buffer::new().format(v).to_string()
        }
        ft::LONGLONG => {
            let b = take(body, pos, 8)?;
            let raw = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            if unsigned {
                itoa_buf.format(raw).to_string()
            } else {
                itoa_buf.format(raw as i64).to_string()
            }
        }
        ft::LONG | ft::INT24 => {
            let b = take(body, pos, 4)?;
            let raw = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if unsigned {
                itoa_buf.format(raw).to_string()
            } else {
                itoa_buf.format(raw as i32).to_string()
            }
        }
        ft::SHORT | ft::YEAR => {
            let b = take(body, pos, 2)?;
            let raw = u16::from_le_bytes([b[0], b[1]]);
            if unsigned {
                itoa_buf.format(raw).to_string()
            } else {
                itoa_buf.format(raw as i16).to_string()
            }
        }
        ft::TINY => {
            let raw = take(body, pos, 1)?[0];
            if unsigned {
                itoa_buf.format(raw).to_string()
            } else {
                itoa_buf.format(raw as i8).to_string()
            }
        }
        ft::DATE | ft::NEWDATE | ft::DATETIME | ft::DATETIME2 | ft::TIMESTAMP
        | ft::TIMESTAMP2 => timestamp_to_string(body, pos)?,
        ft::TIME | ft::TIME2 => time_to_string(body, pos)?,
        ft::NULL => "NULL".to_string(),
        // Everything else is a length-encoded byte value.
        _ => {
            let mut p = *pos;
            let len = read_lenenc_int(body, &mut p)?.unwrap_or(0) as usize;
            let data = body.get(p..p + len).ok_or(SqlGateError::Underflow)?;
            *pos = p + len;
            quote_bytes(data)
        }
    };
    Ok(text)
}

/// Quotes a byte value as an SQL string. Single quotes are escaped by
/// doubling them up; backslash escapes depend on the SQL_MODE and are a
/// non-standard method.
fn quote_bytes(data: &[u8]) -> String {
    let raw = String::from_utf8_lossy(data);
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

fn push_fixed(out: &mut String, value: u64, digits: usize) {
    let s = value.to_string();
    for _ in s.len()..digits {
        out.push('0');
    }
    out.push_str(&s);
}

fn format_time_part(
    out: &mut String,
    days: u32,
    hours: u8,
    minutes: u8,
    seconds: u8,
    micros: u32,
) {
    if days > 0 {
        // The TIME type itself only supports values up to 838 hours but the
        // network encoding can express far more; render what was sent.
        out.push_str(&(u64::from(days) * 24 + u64::from(hours)).to_string());
    } else {
        push_fixed(out, u64::from(hours), 2);
    }
    out.push(':');
    push_fixed(out, u64::from(minutes), 2);
    out.push(':');
    push_fixed(out, u64::from(seconds), 2);
    if micros > 0 {
        out.push('.');
        push_fixed(out, u64::from(micros), 6);
    }
}

fn time_to_string(body: &[u8], pos: &mut usize) -> Result<String, SqlGateError> {
    let len = take(body, pos, 1)?[0] as usize;
    if len == 0 {
        return Ok("'00:00:00'".to_string());
    }
    let data = take(body, pos, len)?;
    if data.len() < 8 {
        return Err(SqlGateError::Underflow);
    }
    let negative = data[0] != 0;
    let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let (hours, minutes, seconds) = (data[5], data[6], data[7]);
    let micros = if len > 8 && data.len() >= 12 {
        u32::from_le_bytes([data[8], data[9], data[10], data[11]])
    } else {
        0
    };
    let mut out = String::with_capacity(24);
    out.push('\'');
    if negative {
        out.push('-');
    }
    format_time_part(&mut out, days, hours, minutes, seconds, micros);
    out.push('\'');
    Ok(out)
}

fn timestamp_to_string(body: &[u8], pos: &mut usize) -> Result<String, SqlGateError> {
    let len = take(body, pos, 1)?[0] as usize;
    if len == 0 {
        return Ok("'0000-00-00 00:00:00'".to_string());
    }
    let data = take(body, pos, len)?;
    if data.len() < 4 {
        return Err(SqlGateError::Underflow);
    }
    let years = u16::from_le_bytes([data[0], data[1]]);
    let (months, days) = (data[2], data[3]);
    let mut out = String::with_capacity(28);
    out.push('\'');
    push_fixed(&mut out, u64::from(years), 4);
    out.push('-');
    push_fixed(&mut out, u64::from(months), 2);
    out.push('-');
    push_fixed(&mut out, u64::from(days), 2);
    if len > 4 && data.len() >= 7 {
        out.push(' ');
        let micros = if len > 7 && data.len() >= 11 {
            u32::from_le_bytes([data[7], data[8], data[9], data[10]])
        } else {
            0
        };
        format_time_part(&mut out, 0, data[4], data[5], data[6], micros);
    }
    out.push('\'');
    Ok(out)
}
