// src/core/filter/insert_stream.rs

//! Insert streaming: converts consecutive bulk inserts inside an open
//! transaction into a single `LOAD DATA LOCAL INFILE` data stream.
//!
//! The first matching `INSERT INTO t VALUES (...),(...)` is replaced by the
//! LOAD DATA statement; once the backend requests the file, the insert's
//! value lists are reshaped into CSV rows (outer parentheses stripped, rows
//! newline-separated, packet sequence preserved). Later matching inserts to
//! the same table stream more rows. A different target table, any
//! non-insert, or the end of the transaction closes the stream with an
//! empty data packet and routes the trailing statement normally; the OK of
//! the whole LOAD is absorbed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    DownstreamAction, FilterCtx, FilterModule, FilterSession, SessionScope, UpstreamVerdict,
};
use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::constants::{Command, StatusFlags, HEADER_LEN, LOCAL_INFILE_MARKER};
use crate::core::protocol::packets::OkPacket;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::SqlGateError;

/// The statement that starts the stream; the table name is substituted in.
const LOAD_DATA_TEMPLATE: &str = "LOAD DATA LOCAL INFILE 'maxscale.data' INTO TABLE {} \
                                  FIELDS TERMINATED BY ',' LINES TERMINATED BY '\\n'";

static RE_BULK_INSERT: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^\s*INSERT\s+INTO\s+`?([\w.]+)`?\s+VALUES\s*\(")
        .case_insensitive(true)
        .build()
        .expect("static insert regex")
});

#[derive(Debug, Clone)]
pub struct InsertStreamConfig {
    pub scope: SessionScope,
}

pub struct InsertStreamFilter {
    name: String,
    config: InsertStreamConfig,
    streams_opened: Arc<AtomicU64>,
    rows_streamed: Arc<AtomicU64>,
}

impl InsertStreamFilter {
    pub fn new(name: &str, config: InsertStreamConfig) -> Self {
        InsertStreamFilter {
            name: name.to_string(),
            config,
            streams_opened: Arc::new(AtomicU64::new(0)),
            rows_streamed: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl FilterModule for InsertStreamFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        Ok(Box::new(InsertStreamSession {
            active: self.config.scope.applies(&ctx.remote, &ctx.user),
            state: StreamState::Closed,
            streams_opened: self.streams_opened.clone(),
            rows_streamed: self.rows_streamed.clone(),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "streams_opened": self.streams_opened.load(Ordering::Relaxed),
            "rows_streamed": self.rows_streamed.load(Ordering::Relaxed),
        })
    }
}

enum StreamState {
    Closed,
    /// LOAD DATA sent; the first insert's rows wait for the file request.
    RequestSent { table: String, pending: String },
    /// The backend is consuming rows.
    Open { table: String, next_seq: u8 },
    /// The terminator went out; the next complete reply is the LOAD's own
    /// OK and is absorbed.
    Closing,
}

struct InsertStreamSession {
    active: bool,
    state: StreamState,
    streams_opened: Arc<AtomicU64>,
    rows_streamed: Arc<AtomicU64>,
}

/// Extracts the value lists of a bulk insert as CSV rows: parentheses
/// stripped, one row per line.
fn values_to_csv(sql: &str) -> Option<(String, usize)> {
    let start = sql.to_ascii_uppercase().find("VALUES")? + "VALUES".len();
    let bytes = sql.as_bytes();
    let mut csv = String::new();
    let mut rows = 0;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                let mut depth = 1;
                let row_start = i + 1;
                let mut j = row_start;
                while j < bytes.len() && depth > 0 {
                    match bytes[j] {
                        b'(' => depth += 1,
                        b')' => depth -= 1,
                        quote @ (b'\'' | b'"') => {
                            j += 1;
                            while j < bytes.len() {
                                if bytes[j] == b'\\' {
                                    j += 1;
                                } else if bytes[j] == quote {
                                    break;
                                }
                                j += 1;
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
                if depth != 0 {
                    return None;
                }
                csv.push_str(&sql[row_start..j - 1]);
                csv.push('\n');
                rows += 1;
                i = j;
            }
            _ => i += 1,
        }
    }
    if rows == 0 { None } else { Some((csv, rows)) }
}

/// A bulk insert with implicit column order: `INSERT INTO t VALUES (...)`.
fn match_bulk_insert(sql: &str) -> Option<String> {
    RE_BULK_INSERT.captures(sql).map(|cap| cap[1].to_string())
}

fn synth_ok(seq: u8, affected: u64) -> BufChain {
    codec::build_packet(seq, &OkPacket::build(affected, 0, StatusFlags::IN_TRANS))
}

impl InsertStreamSession {
    fn open_stream(&mut self, table: String, csv: String, request_seq: u8) -> DownstreamAction {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        debug!(table = %table, "opening insert stream");
        let sql = LOAD_DATA_TEMPLATE.replace("{}", &table);
        let mut body = Vec::with_capacity(sql.len() + 1);
        body.push(Command::Query.as_byte());
        body.extend_from_slice(sql.as_bytes());
        let packet = codec::build_packet(request_seq, &body);
        self.state = StreamState::RequestSent {
            table,
            pending: csv,
        };
        DownstreamAction::Forward(packet)
    }

    fn close_stream(&mut self, next_seq: u8, trailing: BufChain) -> DownstreamAction {
        debug!("closing insert stream");
        self.state = StreamState::Closing;
        let terminator = codec::build_packet(next_seq, &[]);
        DownstreamAction::ForwardMany(vec![terminator, trailing])
    }
}

#[async_trait(?Send)]
impl FilterSession for InsertStreamSession {
    async fn route_query(
        &mut self,
        packet: BufChain,
        ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        if !self.active {
            return Ok(DownstreamAction::Forward(packet));
        }
        let sql = codec::sql_of(&packet);
        let bulk = sql.as_deref().and_then(match_bulk_insert);

        match std::mem::replace(&mut self.state, StreamState::Closed) {
            StreamState::Closed => {
                if ctx.in_trx
                    && let (Some(table), Some(sql)) = (bulk, sql.as_deref())
                    && let Some((csv, _rows)) = values_to_csv(sql)
                {
                    let seq = codec::peek_header(&packet).map(|h| h.seq).unwrap_or(0);
                    return Ok(self.open_stream(table, csv, seq));
                }
                self.state = StreamState::Closed;
                Ok(DownstreamAction::Forward(packet))
            }
            StreamState::RequestSent { table, pending } => {
                // A request is still in flight; nothing else should arrive
                // before its reply on a sane client, but pass through.
                self.state = StreamState::RequestSent { table, pending };
                Ok(DownstreamAction::Forward(packet))
            }
            StreamState::Open { table, next_seq } => {
                let same_table = bulk.as_deref() == Some(table.as_str());
                if ctx.in_trx
                    && same_table
                    && let Some(sql) = sql.as_deref()
                    && let Some((csv, rows)) = values_to_csv(sql)
                {
                    // Reshape into more rows of the open stream.
                    self.rows_streamed.fetch_add(rows as u64, Ordering::Relaxed);
                    let data = codec::build_packet(next_seq, csv.as_bytes());
                    self.state = StreamState::Open {
                        table,
                        next_seq: next_seq.wrapping_add(1),
                    };
                    let ok = synth_ok(ctx.next_owned_seq(), rows as u64);
                    return Ok(DownstreamAction::RespondAndForward {
                        reply: ok,
                        forward: vec![data],
                    });
                }
                // Table mismatch, non-insert or transaction end: close the
                // stream and route the statement normally.
                Ok(self.close_stream(next_seq, packet))
            }
            StreamState::Closing => {
                self.state = StreamState::Closing;
                Ok(DownstreamAction::Forward(packet))
            }
        }
    }

    async fn client_reply(
        &mut self,
        packet: BufChain,
        reply: &ReplyTracker,
        ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError> {
        if !self.active {
            return Ok(UpstreamVerdict::forward(packet));
        }
        match std::mem::replace(&mut self.state, StreamState::Closed) {
            StreamState::RequestSent { table, pending } => {
                let marker = packet.byte_at(HEADER_LEN);
                if marker == Some(LOCAL_INFILE_MARKER) {
                    // The backend accepted the stream and wants the file.
                    let reply_seq = codec::peek_header(&packet).map(|h| h.seq).unwrap_or(0);
                    let rows = pending.lines().count() as u64;
                    self.rows_streamed.fetch_add(rows, Ordering::Relaxed);
                    let data = codec::build_packet(reply_seq.wrapping_add(1), pending.as_bytes());
                    self.state = StreamState::Open {
                        table,
                        next_seq: reply_seq.wrapping_add(2),
                    };
                    return Ok(UpstreamVerdict {
                        to_client: Some(synth_ok(ctx.next_owned_seq(), rows)),
                        to_backend: vec![data],
                    });
                }
                // The backend refused (e.g. local-infile disabled); surface
                // its answer unchanged.
                self.state = StreamState::Closed;
                Ok(UpstreamVerdict::forward(packet))
            }
            StreamState::Closing => {
                if reply.is_complete() {
                    // The LOAD's own OK; the client already got its answers.
                    self.state = StreamState::Closed;
                    Ok(UpstreamVerdict::consume())
                } else {
                    self.state = StreamState::Closing;
                    Ok(UpstreamVerdict::consume())
                }
            }
            other => {
                self.state = other;
                Ok(UpstreamVerdict::forward(packet))
            }
        }
    }
}
