// src/core/protocol/reply.rs

//! Tracks the progress and attributes of one backend reply.
//!
//! The tracker is fed every packet that arrives from a backend and reports
//! when the logical reply is complete, together with the attributes the
//! router and filters care about: error, affected rows, last insert id,
//! warnings, result-set shape, PREPARE-OK metadata and the GTID position
//! carried in session tracking.

use super::constants::{Capabilities, Command, StatusFlags, LOCAL_INFILE_MARKER};
use super::packets::{read_lenenc_int, EofPacket, ErrPacket, OkPacket};
use crate::core::buffer::BufChain;
use crate::core::protocol::constants::HEADER_LEN;
use crate::core::SqlGateError;

/// What the tracker saw in the packet it just consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyEvent {
    /// More packets are expected.
    InProgress,
    /// The backend requests the LOCAL INFILE payload from the client.
    FileRequest,
    /// The reply is complete.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitingHeader,
    FieldDefs { left: u64 },
    FieldDefsEof,
    Rows,
    PrepareHeader,
    PrepareParams { left: u16 },
    PrepareParamsEof,
    PrepareCols { left: u16 },
    PrepareColsEof,
    Done,
}

/// Per-connection reply state machine.
#[derive(Debug)]
pub struct ReplyTracker {
    state: State,
    command: Option<Command>,
    caps: Capabilities,
    error: Option<ErrPacket>,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    status: StatusFlags,
    field_count: u64,
    param_count: u16,
    ps_id: u32,
    rows: u64,
    gtid: Option<String>,
    schema: Option<String>,
}

impl ReplyTracker {
    pub fn new(caps: Capabilities) -> Self {
        ReplyTracker {
            state: State::Idle,
            command: None,
            caps,
            error: None,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            status: StatusFlags::default(),
            field_count: 0,
            param_count: 0,
            ps_id: 0,
            rows: 0,
            gtid: None,
            schema: None,
        }
    }

    /// Updates the capability set after authentication settles it.
    pub fn set_capabilities(&mut self, caps: Capabilities) {
        self.caps = caps;
    }

    /// A tracker representing an already-complete synthesized reply, for
    /// packets the proxy itself answers (filter responses).
    pub fn synthetic_complete() -> Self {
        let mut tracker = ReplyTracker::new(Capabilities::default());
        tracker.state = State::Done;
        tracker
    }

    fn deprecate_eof(&self) -> bool {
        self.caps.contains(Capabilities::DEPRECATE_EOF)
    }

    /// Arms the tracker for the reply to `command`.
    pub fn start(&mut self, command: Command) {
        self.command = Some(command);
        self.error = None;
        self.affected_rows = 0;
        self.last_insert_id = 0;
        self.warnings = 0;
        self.field_count = 0;
        self.param_count = 0;
        self.rows = 0;
        self.state = match command {
            Command::StmtPrepare => State::PrepareHeader,
            _ if command.will_respond() => State::WaitingHeader,
            _ => State::Idle,
        };
    }

    /// Consumes one complete backend packet.
    pub fn process(&mut self, packet: &BufChain) -> Result<ReplyEvent, SqlGateError> {
        let mut body = packet.to_vec();
        if body.len() < HEADER_LEN {
            return Err(SqlGateError::Underflow);
        }
        let body = body.split_off(HEADER_LEN);
        match self.state {
            State::Idle | State::Done => Err(SqlGateError::Protocol(
                "unexpected packet outside a reply".into(),
            )),
            State::WaitingHeader => self.on_header(&body),
            State::FieldDefs { left } => {
                let left = left - 1;
                if left == 0 {
                    self.state = if self.deprecate_eof() {
                        State::Rows
                    } else {
                        State::FieldDefsEof
                    };
                } else {
                    self.state = State::FieldDefs { left };
                }
                Ok(ReplyEvent::InProgress)
            }
            State::FieldDefsEof => {
                let eof = EofPacket::parse(&body)?;
                self.warnings = eof.warnings;
                self.state = State::Rows;
                Ok(ReplyEvent::InProgress)
            }
            State::Rows => self.on_row(&body),
            State::PrepareHeader => self.on_prepare_header(&body),
            State::PrepareParams { left } => {
                let left = left - 1;
                self.state = if left == 0 {
                    if self.deprecate_eof() {
                        self.after_prepare_params()
                    } else {
                        State::PrepareParamsEof
                    }
                } else {
                    State::PrepareParams { left }
                };
                self.finish_if_done()
            }
            State::PrepareParamsEof => {
                EofPacket::parse(&body)?;
                self.state = self.after_prepare_params();
                self.finish_if_done()
            }
            State::PrepareCols { left } => {
                let left = left - 1;
                self.state = if left == 0 {
                    if self.deprecate_eof() {
                        State::Done
                    } else {
                        State::PrepareColsEof
                    }
                } else {
                    State::PrepareCols { left }
                };
                self.finish_if_done()
            }
            State::PrepareColsEof => {
                EofPacket::parse(&body)?;
                self.state = State::Done;
                self.finish_if_done()
            }
        }
    }

    fn on_header(&mut self, body: &[u8]) -> Result<ReplyEvent, SqlGateError> {
        match body.first() {
            Some(&0x00) => {
                let ok = OkPacket::parse(body, self.caps)?;
                self.absorb_ok(&ok);
                if ok.status.contains(StatusFlags::MORE_RESULTS_EXISTS) {
                    self.state = State::WaitingHeader;
                    Ok(ReplyEvent::InProgress)
                } else {
                    self.state = State::Done;
                    Ok(ReplyEvent::Complete)
                }
            }
            Some(&0xFF) => {
                self.error = Some(ErrPacket::parse(body)?);
                self.state = State::Done;
                Ok(ReplyEvent::Complete)
            }
            Some(&LOCAL_INFILE_MARKER) => {
                // The server asks the client for the file; the next backend
                // packet after the data stream is the final OK/ERR.
                Ok(ReplyEvent::FileRequest)
            }
            Some(_) => {
                let mut pos = 0;
                self.field_count = read_lenenc_int(body, &mut pos)?
                    .ok_or_else(|| SqlGateError::Protocol("bad column count".into()))?;
                self.state = State::FieldDefs {
                    left: self.field_count,
                };
                Ok(ReplyEvent::InProgress)
            }
            None => Err(SqlGateError::Underflow),
        }
    }

    fn on_row(&mut self, body: &[u8]) -> Result<ReplyEvent, SqlGateError> {
        if body.first() == Some(&0xFF) {
            self.error = Some(ErrPacket::parse(body)?);
            self.state = State::Done;
            return Ok(ReplyEvent::Complete);
        }
        let terminal = if self.deprecate_eof() {
            // Terminal is an OK packet with an 0xFE header.
            body.first() == Some(&0xFE) && body.len() < crate::core::protocol::constants::MAX_PAYLOAD_LEN
        } else {
            EofPacket::is_eof(body)
        };
        if terminal {
            let status = if self.deprecate_eof() {
                let ok = OkPacket::parse(body, self.caps)?;
                self.absorb_ok(&ok);
                ok.status
            } else {
                let eof = EofPacket::parse(body)?;
                self.warnings = eof.warnings;
                self.status = eof.status;
                eof.status
            };
            if status.contains(StatusFlags::MORE_RESULTS_EXISTS) {
                self.state = State::WaitingHeader;
                Ok(ReplyEvent::InProgress)
            } else {
                self.state = State::Done;
                Ok(ReplyEvent::Complete)
            }
        } else {
            self.rows += 1;
            Ok(ReplyEvent::InProgress)
        }
    }

    fn on_prepare_header(&mut self, body: &[u8]) -> Result<ReplyEvent, SqlGateError> {
        match body.first() {
            Some(&0x00) => {
                let raw = body.get(1..11).ok_or(SqlGateError::Underflow)?;
                self.ps_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                self.field_count = u64::from(u16::from_le_bytes([raw[4], raw[5]]));
                self.param_count = u16::from_le_bytes([raw[6], raw[7]]);
                self.warnings = u16::from_le_bytes([raw[8], raw[9]]);
                self.state = if self.param_count > 0 {
                    State::PrepareParams {
                        left: self.param_count,
                    }
                } else {
                    self.after_prepare_params()
                };
                self.finish_if_done()
            }
            Some(&0xFF) => {
                self.error = Some(ErrPacket::parse(body)?);
                self.state = State::Done;
                Ok(ReplyEvent::Complete)
            }
            _ => Err(SqlGateError::Protocol("malformed PREPARE reply".into())),
        }
    }

    fn after_prepare_params(&self) -> State {
        if self.field_count > 0 {
            State::PrepareCols {
                left: self.field_count as u16,
            }
        } else {
            State::Done
        }
    }

    fn finish_if_done(&mut self) -> Result<ReplyEvent, SqlGateError> {
        if self.state == State::Done {
            Ok(ReplyEvent::Complete)
        } else {
            Ok(ReplyEvent::InProgress)
        }
    }

    fn absorb_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.status = ok.status;
        if ok.gtid.is_some() {
            self.gtid = ok.gtid.clone();
        }
        if ok.schema.is_some() {
            self.schema = ok.schema.clone();
        }
    }

    // --- attribute accessors ---

    pub fn command(&self) -> Option<Command> {
        self.command
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// True while the reply is inside its row stream; the packet that was
    /// just processed was a data row.
    pub fn in_result_rows(&self) -> bool {
        self.state == State::Rows
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle | State::Done)
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        self.error.as_ref()
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn status(&self) -> StatusFlags {
        self.status
    }

    pub fn field_count(&self) -> u64 {
        self.field_count
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    /// Statement id announced by a PREPARE-OK reply.
    pub fn ps_id(&self) -> u32 {
        self.ps_id
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Last GTID position observed through session tracking, if any.
    pub fn gtid(&self) -> Option<&str> {
        self.gtid.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }
}
