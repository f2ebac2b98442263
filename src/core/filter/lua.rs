// src/core/filter/lua.rs

//! Lua hook filter: user-supplied scripts observe and steer the query
//! stream.
//!
//! Two script scopes exist: a global script shared by all sessions (its
//! hooks run under a mutex) and a per-session script instantiated for each
//! new session. A script's `routeQuery(sql)` may veto the statement
//! (return `false`; the client receives an access-denied error), substitute
//! it (return a string) or let it pass (`nil` or `true`). Any other return
//! type is ambiguous; it is logged once per script and treated as a pass,
//! so operators notice scripts relying on unspecified behavior.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mlua::{Function, Lua, Value as LuaValue};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{DownstreamAction, FilterCtx, FilterModule, FilterSession, UpstreamVerdict};
use crate::core::buffer::BufChain;
use crate::core::protocol::codec;
use crate::core::protocol::constants::{error_codes, Command};
use crate::core::protocol::packets::ErrPacket;
use crate::core::protocol::reply::ReplyTracker;
use crate::core::SqlGateError;

#[derive(Debug, Clone, Default)]
pub struct LuaFilterConfig {
    pub global_script: Option<String>,
    pub session_script: Option<String>,
}

/// What a `routeQuery` hook asked for.
enum HookDecision {
    Pass,
    Veto,
    Substitute(String),
}

struct Script {
    lua: Lua,
    ambiguous_warned: AtomicBool,
    path: String,
}

impl Script {
    fn load(path: &str) -> Result<Script, SqlGateError> {
        let lua = Lua::new();
        let source = std::fs::read_to_string(path)?;
        lua.load(&source).exec()?;
        Ok(Script {
            lua,
            ambiguous_warned: AtomicBool::new(false),
            path: path.to_string(),
        })
    }

    fn call_route_query(&self, sql: &str) -> Result<HookDecision, SqlGateError> {
        let Ok(func) = self.lua.globals().get::<Function>("routeQuery") else {
            return Ok(HookDecision::Pass);
        };
        let result: LuaValue = func.call(sql.to_string())?;
        Ok(match result {
            LuaValue::Nil | LuaValue::Boolean(true) => HookDecision::Pass,
            LuaValue::Boolean(false) => HookDecision::Veto,
            LuaValue::String(s) => HookDecision::Substitute(s.to_string_lossy().to_string()),
            other => {
                if !self.ambiguous_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        script = %self.path,
                        "routeQuery returned a {} value; the contract is \
                         false=veto, string=substitute, nil/true=pass - treating as pass",
                        other.type_name()
                    );
                }
                HookDecision::Pass
            }
        })
    }

    fn call_simple(&self, name: &str, args: impl mlua::IntoLuaMulti) {
        if let Ok(func) = self.lua.globals().get::<Function>(name)
            && let Err(e) = func.call::<()>(args)
        {
            warn!(script = %self.path, hook = name, "lua hook failed: {e}");
        }
    }
}

pub struct LuaFilter {
    name: String,
    config: LuaFilterConfig,
    global: Option<Arc<Mutex<Script>>>,
    vetoed: Arc<AtomicU64>,
    substituted: Arc<AtomicU64>,
}

impl LuaFilter {
    pub fn new(name: &str, config: LuaFilterConfig) -> Result<Self, SqlGateError> {
        let global = match &config.global_script {
            Some(path) => {
                info!(filter = name, script = %path, "loading global lua script");
                Some(Arc::new(Mutex::new(Script::load(path)?)))
            }
            None => None,
        };
        Ok(LuaFilter {
            name: name.to_string(),
            config,
            global,
            vetoed: Arc::new(AtomicU64::new(0)),
            substituted: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl FilterModule for LuaFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, ctx: &FilterCtx) -> Result<Box<dyn FilterSession>, SqlGateError> {
        let session_script = match &self.config.session_script {
            Some(path) => {
                let script = Script::load(path)?;
                script.call_simple("newSession", (ctx.user.clone(), ctx.remote.clone()));
                Some(script)
            }
            None => None,
        };
        if let Some(global) = &self.global {
            global
                .lock()
                .call_simple("newSession", (ctx.user.clone(), ctx.remote.clone()));
        }
        Ok(Box::new(LuaSession {
            session_script,
            global: self.global.clone(),
            vetoed: self.vetoed.clone(),
            substituted: self.substituted.clone(),
        }))
    }

    fn diagnostics(&self) -> Value {
        json!({
            "global_script": self.config.global_script,
            "session_script": self.config.session_script,
            "queries_vetoed": self.vetoed.load(Ordering::Relaxed),
            "queries_substituted": self.substituted.load(Ordering::Relaxed),
        })
    }
}

struct LuaSession {
    session_script: Option<Script>,
    global: Option<Arc<Mutex<Script>>>,
    vetoed: Arc<AtomicU64>,
    substituted: Arc<AtomicU64>,
}

impl LuaSession {
    fn decide(&self, sql: &str) -> Result<HookDecision, SqlGateError> {
        // The session script gets first say; the global script can still
        // veto or substitute what the session script passed.
        if let Some(script) = &self.session_script {
            match script.call_route_query(sql)? {
                HookDecision::Pass => {}
                other => return Ok(other),
            }
        }
        if let Some(global) = &self.global {
            return global.lock().call_route_query(sql);
        }
        Ok(HookDecision::Pass)
    }
}

#[async_trait(?Send)]
impl FilterSession for LuaSession {
    async fn route_query(
        &mut self,
        packet: BufChain,
        ctx: &mut FilterCtx,
    ) -> Result<DownstreamAction, SqlGateError> {
        let Some(sql) = codec::sql_of(&packet) else {
            return Ok(DownstreamAction::Forward(packet));
        };
        match self.decide(&sql)? {
            HookDecision::Pass => Ok(DownstreamAction::Forward(packet)),
            HookDecision::Veto => {
                self.vetoed.fetch_add(1, Ordering::Relaxed);
                let body = ErrPacket::build(
                    error_codes::ER_ACCESS_DENIED,
                    "28000",
                    &format!("Access denied for user '{}'", ctx.user),
                );
                Ok(DownstreamAction::Respond(codec::build_packet(
                    ctx.next_owned_seq(),
                    &body,
                )))
            }
            HookDecision::Substitute(new_sql) => {
                self.substituted.fetch_add(1, Ordering::Relaxed);
                let header = codec::peek_header(&packet).ok_or(SqlGateError::Underflow)?;
                let mut body = Vec::with_capacity(new_sql.len() + 1);
                body.push(Command::Query.as_byte());
                body.extend_from_slice(new_sql.as_bytes());
                Ok(DownstreamAction::Forward(codec::build_packet(
                    header.seq, &body,
                )))
            }
        }
    }

    async fn client_reply(
        &mut self,
        packet: BufChain,
        reply: &ReplyTracker,
        _ctx: &mut FilterCtx,
    ) -> Result<UpstreamVerdict, SqlGateError> {
        if reply.is_complete() {
            if let Some(script) = &self.session_script {
                script.call_simple("clientReply", ());
            }
            if let Some(global) = &self.global {
                global.lock().call_simple("clientReply", ());
            }
        }
        Ok(UpstreamVerdict::forward(packet))
    }

    fn on_session_close(&mut self, _ctx: &mut FilterCtx) {
        if let Some(script) = &self.session_script {
            script.call_simple("closeSession", ());
        }
        if let Some(global) = &self.global {
            global.lock().call_simple("closeSession", ());
        }
    }
}
