// src/core/filter/top_queries.rs

//! Top-N latency filter: times every statement from request to full reply,
//! retains the N slowest per session and writes a formatted report when the
//! session closes.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
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

#[derive(Debug, Clone)]
pub struct TopQueriesConfig {
    /// How many of the slowest statements to keep.
    pub count: usize,
    /// Report files are written as `<filebase>.<session_id>`.
    pub filebase: String,
    pub match_pattern: Option<String>,
    pub exclude_pattern: Option<String>,
    pub scope: SessionScope,
}

pub struct TopQueriesFilter {
    name: String,
    config: TopQueriesConfig,
    match_re: Option<Regex>,
    exclude_re: Option<Regex>,
    sessions_logged: Arc<AtomicU64>,
}

impl TopQueriesFilter {
    pub fn new(name: &str, config: TopQueriesConfig) -> Result<Self, SqlGateError> {
        let match_re = config.match_pattern.as_deref().map(Regex::new).transpose()?;
        let exclude_re = config
            .exclude_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(TopQueriesFilter {
            name: name.to_string(),
            config,
            match_re,
            exclude_re,
            sessions_logged: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl FilterModule for TopQueriesFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        Ok(Box::new(TopQueriesSession {
            active: self.config.scope.applies(&ctx.remote, &ctx.user),
            count: self.config.count,
            filebase: self.config.filebase.clone(),
            match_re: self.match_re.clone(),
            exclude_re: self.exclude_re.clone(),
            current: None,
            top: Vec::new(),
            total_queries: 0,
            total_time: Duration::ZERO,
            started: Instant::now(),
            sessions_logged: self.sessions_logged.clone(),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "count": self.config.count,
            "filebase": self.config.filebase,
            "sessions_logged": self.sessions_logged.load(Ordering::Relaxed),
        })
    }
}

struct TimedQuery {
    latency: Duration,
    sql: String,
}

struct TopQueriesSession {
    active: bool,
    count: usize,
    filebase: String,
    match_re: Option<Regex>,
    exclude_re: Option<Regex>,
    /// The statement in flight, with its send timestamp.
    current: Option<(String, Instant)>,
    top: Vec<TimedQuery>,
    total_queries: u64,
    total_time: Duration,
    started: Instant,
    sessions_logged: Arc<AtomicU64>,
}

impl TopQueriesSession {
    fn passes(&self, sql: &str) -> bool {
        if let Some(re) = &self.match_re
            && !re.is_match(sql)
        {
            return false;
        }
        if let Some(re) = &self.exclude_re
            && re.is_match(sql)
        {
            return false;
        }
        true
    }

    fn record(&mut self, sql: String, latency: Duration) {
        self.total_queries += 1;
        self.total_time += latency;
        let pos = self
            .top
            .partition_point(|entry| entry.latency >= latency);
        if pos < self.count {
            self.top.insert(pos, TimedQuery { latency, sql });
            self.top.truncate(self.count);
        }
    }

    fn write_report(&self, ctx: &FilterCtx) -> std::io::Result<()> {
        let path = format!("{}.{}", self.filebase, ctx.session_id);
        let mut file = File::create(&path)?;
        writeln!(file, "Top {} longest running queries in session.", self.count)?;
        writeln!(file, "==========================================")?;
        writeln!(file, "Time (sec) | Query")?;
        writeln!(file, "-----------+-----------------------------")?;
        for entry in &self.top {
            writeln!(
                file,
                "{:10.3} | {}",
                entry.latency.as_secs_f64(),
                entry.sql
            )?;
        }
        writeln!(file, "-----------+-----------------------------")?;
        let avg = if self.total_queries > 0 {
            self.total_time.as_secs_f64() / self.total_queries as f64
        } else {
            0.0
        };
        writeln!(file, "Session started {:.1}s ago", self.started.elapsed().as_secs_f64())?;
        writeln!(file, "Connection from {}", ctx.remote)?;
        writeln!(file, "Username        {}", ctx.user)?;
        writeln!(file, "Total of {} statements executed.", self.total_queries)?;
        writeln!(file, "Average statement execution time {avg:9.3} seconds.")?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl FilterSession for TopQueriesSession {
    async fn route_query(
        &mut self,
        packet: BufChain,
        _ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        if self.active
            && let Some(sql) = codec::sql_of(&packet)
            && self.passes(&sql)
        {
            self.current = Some((sql, Instant::now()));
        }
        Ok(DownstreamAction::Forward(packet))
    }

    async fn client_reply(
        &mut self,
        packet: BufChain,
        reply: &ReplyTracker,
        _ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError> {
        if reply.is_complete()
            && let Some((sql, sent)) = self.current.take()
        {
            self.record(sql, sent.elapsed());
        }
        Ok(UpstreamVerdict::forward(packet))
    }

    fn on_session_close(&mut self, ctx: &mut FilterCtx) {
        if !self.active || self.total_queries == 0 {
            return;
        }
        self.sessions_logged.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.write_report(ctx) {
            warn!(session = ctx.session_id, "failed to write top queries report: {e}");
        }
    }
}
