// src/core/filter/query_log.rs

//! Query log filter: appends every routed statement to a log file with a
//! timestamp and the session's user@host.
//!
//! Logging is per-session (`<filebase>.<session_id>`) or unified (one file
//! for the whole service), with optional match/exclude scoping and a
//! configurable field separator. Writes are best-effort; a failed write
//! never affects routing.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use super::{
    DownstreamAction, FilterCtx, FilterModule, FilterSession, SessionScope, UpstreamVerdict,
};
use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::SqlGateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// One file per session.
    Session,
    /// One shared file.
    Unified,
}

#[derive(Debug, Clone)]
pub struct QueryLogConfig {
    pub filebase: String,
    pub mode: LogMode,
    pub separator: String,
    pub match_pattern: Option<String>,
    pub exclude_pattern: Option<String>,
    pub scope: SessionScope,
}

pub struct QueryLogFilter {
    name: String,
    config: QueryLogConfig,
    match_re: Option<Regex>,
    exclude_re: Option<Regex>,
    unified: Option<Arc<Mutex<File>>>,
    lines_written: Arc<AtomicU64>,
}

impl QueryLogFilter {
    pub fn new(name: &str, config: QueryLogConfig) -> Result<Self, SqlGateError> {
        let match_re = config.match_pattern.as_deref().map(Regex::new).transpose()?;
        let exclude_re = config
            .exclude_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        let unified = if config.mode == LogMode::Unified {
            Some(Arc::new(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(format!("{}.unified", config.filebase))?,
            )))
        } else {
            None
        };
        Ok(QueryLogFilter {
            name: name.to_string(),
            config,
            match_re,
            exclude_re,
            unified,
            lines_written: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl FilterModule for QueryLogFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        let active = self.config.scope.applies(&ctx.remote, &ctx.user);
        let sink = if !active {
            None
        } else if let Some(unified) = &self.unified {
            Some(unified.clone())
        } else {
            let path = format!("{}.{}", self.config.filebase, ctx.session_id);
            Some(Arc::new(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )))
        };
        Ok(Box::new(QueryLogSession {
            sink,
            separator: self.config.separator.clone(),
            match_re: self.match_re.clone(),
            exclude_re: self.exclude_re.clone(),
            lines_written: self.lines_written.clone(),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "filebase": self.config.filebase,
            "lines_written": self.lines_written.load(Ordering::Relaxed),
        })
    }
}

struct QueryLogSession {
    sink: Option<Arc<Mutex<File>>>,
    separator: String,
    match_re: Option<Regex>,
    exclude_re: Option<Regex>,
    lines_written: Arc<AtomicU64>,
}

#[async_trait(?Send)]
impl FilterSession for QueryLogSession {
    async fn route_query(
        &mut self,
        packet: BufChain,
        ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        let Some(sink) = &self.sink else {
            return Ok(DownstreamAction::Forward(packet));
        };
        let Some(sql) = codec::sql_of(&packet) else {
            return Ok(DownstreamAction::Forward(packet));
        };
        let skip = self.match_re.as_ref().is_some_and(|re| !re.is_match(&sql))
            || self.exclude_re.as_ref().is_some_and(|re| re.is_match(&sql));
        if !skip {
            let sep = &self.separator;
            let line = format!(
                "{}{sep}{}@{}{sep}{sql}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                ctx.user,
                ctx.remote,
            );
            if let Err(e) = writeln!(sink.lock(), "{line}") {
                warn!(session = ctx.session_id, "query log write failed: {e}");
            } else {
                self.lines_written.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(DownstreamAction::Forward(packet))
    }

    async fn client_reply(
        &mut self,
        packet: BufChain,
        _reply: &ReplyTracker,
        _ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError> {
        Ok(UpstreamVerdict::forward(packet))
    }
}
