// src/core/filter/regex_rewrite.rs

//! Regex rewrite filter: substitutes matching SQL before it reaches the
//! router.
//!
//! Substitution is global over the statement text. Matches (and optionally
//! non-matches) can be appended to a log file. Non-SQL commands pass
//! through untouched, as do sessions outside the configured source/user
//! scope.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    DownstreamAction, FilterCtx, FilterModule, FilterSession, SessionScope, UpstreamVerdict,
};
use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::constants::Command;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::SqlGateError;

/// Configuration of one regex filter instance.
#[derive(Debug, Clone)]
pub struct RegexRewriteConfig {
    pub pattern: String,
    pub replace: String,
    pub case_insensitive: bool,
    /// Ignore literal whitespace in the pattern (extended syntax).
    pub extended: bool,
    pub scope: SessionScope,
    pub log_file: Option<String>,
    /// Also log statements that did not match.
    pub log_trace: bool,
    /// Retained for compatibility with PCRE2-based configurations, where
    /// the substitute buffer grows by this factor on NOMEMORY. The Rust
    /// regex engine sizes its output itself, so the value is validated and
    /// otherwise unused.
    pub growth_factor: f64,
}

impl Default for RegexRewriteConfig {
    fn default() -> Self {
        RegexRewriteConfig {
            pattern: String::new(),
            replace: String::new(),
            case_insensitive: true,
            extended: false,
            scope: SessionScope::default(),
            log_file: None,
            log_trace: false,
            growth_factor: 1.5,
        }
    }
}

/// State shared by the module and its sessions.
struct RegexShared {
    regex: Regex,
    replace: String,
    log: Option<Mutex<File>>,
    log_trace: bool,
    matched: AtomicU64,
    total: AtomicU64,
}

/// The module: compiled pattern plus counters.
pub struct RegexRewriteFilter {
    name: String,
    config: RegexRewriteConfig,
    shared: Arc<RegexShared>,
}

impl RegexRewriteFilter {
    pub fn new(name: &str, config: RegexRewriteConfig) -> Result<Self, SqlGateError> {
        if config.growth_factor < 1.0 {
            return Err(SqlGateError::Config(
                "regex growth factor must be at least 1.0".into(),
            ));
        }
        let regex = RegexBuilder::new(&config.pattern)
            .case_insensitive(config.case_insensitive)
            .ignore_whitespace(config.extended)
            .build()?;
        let log = match &config.log_file {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        Ok(RegexRewriteFilter {
            name: name.to_string(),
            shared: Arc::new(RegexShared {
                regex,
                replace: config.replace.clone(),
                log,
                log_trace: config.log_trace,
                matched: AtomicU64::new(0),
                total: AtomicU64::new(0),
            }),
            config,
        })
    }
}

impl FilterModule for RegexRewriteFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        Ok(Box::new(RegexRewriteSession {
            shared: self.shared.clone(),
            active: self.config.scope.applies(&ctx.remote, &ctx.user),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "match": self.config.pattern,
            "replace": self.config.replace,
            "queries_matched": self.shared.matched.load(Ordering::Relaxed),
            "queries_seen": self.shared.total.load(Ordering::Relaxed),
        })
    }
}

struct RegexRewriteSession {
    shared: Arc<RegexShared>,
    active: bool,
}

#[async_trait(?Send)]
impl FilterSession for RegexRewriteSession {
    async fn route_query(
        &mut self,
        packet: BufChain,
        _ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        if !self.active {
            return Ok(DownstreamAction::Forward(packet));
        }
        let Some(sql) = codec::sql_of(&packet) else {
            return Ok(DownstreamAction::Forward(packet));
        };
        self.shared.total.fetch_add(1, Ordering::Relaxed);
        if self.shared.regex.is_match(&sql) {
            self.shared.matched.fetch_add(1, Ordering::Relaxed);
            let rewritten = self
                .shared
                .regex
                .replace_all(&sql, self.shared.replace.as_str())
                .into_owned();
            debug!(original = %sql, rewritten = %rewritten, "regex filter rewrote query");
            if let Some(log) = &self.shared.log {
                let _ = writeln!(log.lock(), "re: {sql} -> {rewritten}");
            }
            let header = codec::peek_header(&packet).ok_or(SqlGateError::Underflow)?;
            let mut body = Vec::with_capacity(rewritten.len() + 1);
            body.push(Command::Query.as_byte());
            body.extend_from_slice(rewritten.as_bytes());
            Ok(DownstreamAction::Forward(codec::build_packet(
                header.seq, &body,
            )))
        } else {
            if self.shared.log_trace
                && let Some(log) = &self.shared.log
            {
                let _ = writeln!(log.lock(), "no match: {sql}");
            }
            Ok(DownstreamAction::Forward(packet))
        }
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
