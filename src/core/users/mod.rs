// src/core/users/mod.rs

//! The user-account cache.
//!
//! A background refresher periodically rebuilds the account table from the
//! authoritative source (the cluster directory, reached through the
//! `AccountSource` trait) and publishes it through the SharedData channel,
//! so authentication lookups on workers are wait-free. A lookup miss can
//! trigger a one-shot on-demand refresh, bounded by a rate limiter to
//! prevent thundering herds. Stale readers are tolerated by design.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wildmatch::WildMatch;

use crate::core::shared::SharedData;
use crate::core::SqlGateError;

/// How a host pattern of an account entry matches a client address.
#[derive(Debug, Clone)]
pub enum HostPattern {
    /// Matches any host (`%`).
    Any,
    /// Exact address.
    Addr(IpAddr),
    /// CIDR network.
    Net(IpNet),
    /// MySQL-style glob with `%` and `_` wildcards.
    Glob(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> HostPattern {
        if pattern == "%" || pattern.is_empty() {
            return HostPattern::Any;
        }
        if let Ok(net) = IpNet::from_str(pattern) {
            return HostPattern::Net(net);
        }
        if let Ok(addr) = IpAddr::from_str(pattern) {
            return HostPattern::Addr(addr);
        }
        HostPattern::Glob(pattern.to_string())
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Addr(a) => *a == addr,
            HostPattern::Net(net) => net.contains(&addr),
            HostPattern::Glob(glob) => {
                let pattern = glob.replace('%', "*").replace('_', "?");
                WildMatch::new(&pattern).matches(&addr.to_string())
            }
        }
    }

    /// Lower is more specific; used to order candidate entries.
    fn specificity(&self) -> u8 {
        match self {
            HostPattern::Addr(_) => 0,
            HostPattern::Net(_) => 1,
            HostPattern::Glob(_) => 2,
            HostPattern::Any => 3,
        }
    }
}

/// One account entry from the authoritative source.
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub user: String,
    pub host: HostPattern,
    pub auth_plugin: String,
    /// Password-equivalent hash per plugin; for `mysql_native_password`
    /// this is SHA1(SHA1(password)).
    pub auth_token_hash: Vec<u8>,
    pub default_db: Option<String>,
    /// Databases the account may use; empty means all.
    pub grants: Vec<String>,
    pub roles: Vec<String>,
    pub require_ssl: bool,
}

impl UserEntry {
    pub fn may_access_db(&self, db: &str) -> bool {
        self.grants.is_empty() || self.grants.iter().any(|g| g == db || g == "*")
    }
}

/// Why a lookup failed; maps onto the vendor error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    UnknownUser,
    NoDbAccess,
    NoSslConnection,
}

/// The deduplicated, published account table.
#[derive(Debug, Clone, Default)]
pub struct UserDatabase {
    entries: Vec<UserEntry>,
    pub version: u64,
}

impl UserDatabase {
    pub fn new(mut entries: Vec<UserEntry>, version: u64) -> Self {
        // Deduplicate on (user, host rendering), keeping the first
        // occurrence, then order the most specific host patterns first.
        let mut seen = std::collections::HashSet::new();
        entries.retain(|e| seen.insert((e.user.clone(), format!("{:?}", e.host))));
        entries.sort_by_key(|e| e.host.specificity());
        UserDatabase { entries, version }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the best entry for (user, client address, requested db).
    pub fn lookup(
        &self,
        user: &str,
        addr: IpAddr,
        db: Option<&str>,
        ssl: bool,
    ) -> Result<&UserEntry, LookupError> {
        let mut found_user = false;
        for entry in &self.entries {
            if entry.user != user || !entry.host.matches(addr) {
                continue;
            }
            found_user = true;
            if entry.require_ssl && !ssl {
                return Err(LookupError::NoSslConnection);
            }
            if let Some(db) = db
                && !entry.may_access_db(db)
            {
                return Err(LookupError::NoDbAccess);
            }
            return Ok(entry);
        }
        if found_user {
            Err(LookupError::NoDbAccess)
        } else {
            Err(LookupError::UnknownUser)
        }
    }
}

/// Computes the stored double-SHA1 hash from a cleartext password, as the
/// authoritative source would deliver it for `mysql_native_password`.
pub fn native_password_hash(password: &str) -> Vec<u8> {
    let stage1 = Sha1::digest(password.as_bytes());
    Sha1::digest(stage1).to_vec()
}

/// The authoritative account directory. Implementations live outside the
/// core; tests use an in-memory source.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<UserEntry>, SqlGateError>;
}

/// Sliding-window rate limiter bounding on-demand refreshes.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_events: usize,
    events: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        RateLimiter {
            window,
            max_events,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Records an attempt; returns false when the window is exhausted.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut events = self.events.lock();
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        if events.len() >= self.max_events {
            return false;
        }
        events.push_back(now);
        true
    }
}

/// Handle workers use to nudge the refresher after a lookup miss.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
    limiter: Arc<RateLimiter>,
}

impl RefreshHandle {
    /// Requests a one-shot refresh; silently dropped when rate-limited or
    /// when one is already queued.
    pub fn request(&self) {
        if self.limiter.allow() {
            let _ = self.tx.try_send(());
        } else {
            debug!("on-demand user refresh suppressed by rate limiter");
        }
    }
}

/// The background refresher task. Each rebuild is submitted as an update
/// through one SharedData producer slot; the user-cache Collector folds it
/// (a wholesale replacement) and publishes to every worker's view.
pub struct UserCacheRefresher {
    source: Arc<dyn AccountSource>,
    producer: Arc<SharedData<UserDatabase, UserDatabase>>,
    interval: Duration,
    rx: mpsc::Receiver<()>,
    version: u64,
}

impl UserCacheRefresher {
    pub fn new(
        source: Arc<dyn AccountSource>,
        producer: Arc<SharedData<UserDatabase, UserDatabase>>,
        interval: Duration,
        refresh_limit: usize,
        refresh_window: Duration,
    ) -> (Self, RefreshHandle) {
        let (tx, rx) = mpsc::channel(1);
        let handle = RefreshHandle {
            tx,
            limiter: Arc::new(RateLimiter::new(refresh_limit, refresh_window)),
        };
        (
            UserCacheRefresher {
                source,
                producer,
                interval,
                rx,
                version: 0,
            },
            handle,
        )
    }

    /// Runs until the process shuts down: refresh on the interval or on
    /// demand, whichever fires first.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                nudge = self.rx.recv() => {
                    if nudge.is_none() {
                        return;
                    }
                    info!("on-demand user cache refresh");
                }
            }
            if crate::core::shared::is_shutting_down() {
                return;
            }
            self.refresh_once().await;
        }
    }

    async fn refresh_once(&mut self) {
        match self.source.fetch_all().await {
            Ok(entries) => {
                self.version += 1;
                let db = UserDatabase::new(entries, self.version);
                debug!(
                    entries = db.len(),
                    version = db.version,
                    "submitting refreshed user database"
                );
                self.producer.send_update(db);
            }
            Err(e) => {
                warn!("user cache refresh failed, keeping stale table: {e}");
            }
        }
    }
}
