// src/core/monitor/mod.rs

//! The monitor surface as routers consume it.
//!
//! Monitor modules themselves live outside the core; what the core defines
//! is the `ServerStatusFlags` vocabulary, the per-server snapshot, the
//! atomically published cluster view and the invariants a well-behaved
//! monitor upholds. Snapshots travel through the SharedData channel so
//! router reads are wait-free and always see a consistent view.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::warn;

bitflags! {
    /// Status bits a monitor may assert on a server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ServerStatusFlags: u32 {
        const RUNNING    = 1;
        const MASTER     = 1 << 1;
        const SLAVE      = 1 << 2;
        const RELAY      = 1 << 3;
        const MAINT      = 1 << 4;
        const DRAIN      = 1 << 5;
        const READ_ONLY  = 1 << 6;
        /// Sticky opt-in bit permitting "stale master" behavior during a
        /// failover window.
        const WAS_MASTER = 1 << 7;
    }
}

impl ServerStatusFlags {
    pub fn is_usable(&self) -> bool {
        self.contains(ServerStatusFlags::RUNNING)
            && !self.intersects(ServerStatusFlags::MAINT | ServerStatusFlags::DRAIN)
    }

    pub fn is_master(&self) -> bool {
        self.is_usable() && self.contains(ServerStatusFlags::MASTER)
    }

    pub fn is_slave(&self) -> bool {
        self.is_usable() && self.contains(ServerStatusFlags::SLAVE)
    }
}

/// State of a replication I/O thread.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveIoState {
    No,
    Connecting,
    Yes,
}

/// One replication connection of a slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveConnection {
    /// server_id of the replication source.
    pub source_id: u64,
    pub io_state: SlaveIoState,
    pub sql_running: bool,
    pub gtid: String,
}

/// The monitored state of one backend server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub flags: ServerStatusFlags,
    pub server_id: u64,
    /// Replication group for multi-master topologies; 0 means ungrouped.
    pub master_group: u32,
    /// Seconds behind the master, negative when unknown.
    pub replication_lag: i64,
    /// Current GTID position, empty when unknown.
    pub gtid_current_pos: String,
    pub slave_connections: Vec<SlaveConnection>,
}

/// A consistent view over all monitored servers, published atomically.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub servers: HashMap<String, ServerSnapshot>,
}

impl ClusterSnapshot {
    pub fn status_of(&self, server: &str) -> ServerStatusFlags {
        self.servers
            .get(server)
            .map(|s| s.flags)
            .unwrap_or_default()
    }

    pub fn master(&self) -> Option<(&str, &ServerSnapshot)> {
        self.servers
            .iter()
            .find(|(_, s)| s.flags.is_master())
            .map(|(name, s)| (name.as_str(), s))
    }
}

/// An update folded into the master copy by the status Collector.
#[derive(Debug, Clone)]
pub enum ClusterUpdate {
    /// Replace or insert the state of one server.
    Server(String, ServerSnapshot),
    /// Forget a destroyed server.
    Remove(String),
}

/// Folds one update into the master snapshot. This is the fold function the
/// status Collector runs with.
pub fn apply_update(snapshot: &mut ClusterSnapshot, update: ClusterUpdate) {
    match update {
        ClusterUpdate::Server(name, state) => {
            snapshot.servers.insert(name, state);
        }
        ClusterUpdate::Remove(name) => {
            snapshot.servers.remove(&name);
        }
    }
}

/// Policies gating whether MASTER stays asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MasterConditions {
    /// No extra requirement beyond RUNNING.
    #[default]
    None,
    /// The master must have at least one connected slave.
    ConnectedSlave,
    /// The master must not be in read-only mode.
    Writable,
}

/// Policies gating whether SLAVE stays asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlaveConditions {
    /// A running replication thread suffices.
    #[default]
    None,
    /// Both the I/O and SQL threads must be running.
    LinkedToMaster,
}

/// Evaluates whether a server may keep its MASTER flag under the policy.
pub fn master_condition_holds(server: &ServerSnapshot, cond: MasterConditions) -> bool {
    match cond {
        MasterConditions::None => true,
        MasterConditions::ConnectedSlave => server
            .slave_connections
            .iter()
            .any(|c| c.io_state == SlaveIoState::Yes && c.sql_running),
        MasterConditions::Writable => !server.flags.contains(ServerStatusFlags::READ_ONLY),
    }
}

/// Evaluates whether a server may keep its SLAVE flag under the policy.
pub fn slave_condition_holds(server: &ServerSnapshot, cond: SlaveConditions) -> bool {
    match cond {
        SlaveConditions::None => true,
        SlaveConditions::LinkedToMaster => server
            .slave_connections
            .iter()
            .any(|c| c.io_state == SlaveIoState::Yes && c.sql_running),
    }
}

/// Checks the documented monitor invariants over a snapshot, logging and
/// returning any violations:
/// at most one master per replication group unless multi-master is allowed;
/// SLAVE requires a connected, SQL-running replication thread to a known
/// server; RELAY requires both MASTER and SLAVE.
pub fn verify_snapshot(snapshot: &ClusterSnapshot, multi_master: bool) -> Vec<String> {
    let mut violations = Vec::new();
    let known_ids: Vec<u64> = snapshot.servers.values().map(|s| s.server_id).collect();

    if !multi_master {
        let mut masters_per_group: HashMap<u32, Vec<&str>> = HashMap::new();
        for (name, server) in &snapshot.servers {
            if server.flags.contains(ServerStatusFlags::MASTER) {
                masters_per_group
                    .entry(server.master_group)
                    .or_default()
                    .push(name);
            }
        }
        for (group, masters) in masters_per_group {
            if masters.len() > 1 {
                violations.push(format!(
                    "replication group {group} has {} masters: {}",
                    masters.len(),
                    masters.join(", ")
                ));
            }
        }
    }

    for (name, server) in &snapshot.servers {
        let flags = server.flags;
        if flags.contains(ServerStatusFlags::SLAVE) {
            let linked = server.slave_connections.iter().any(|c| {
                c.io_state == SlaveIoState::Yes
                    && c.sql_running
                    && known_ids.contains(&c.source_id)
            });
            if !linked {
                violations.push(format!(
                    "'{name}' is flagged slave without a running replication \
                     thread to a known server"
                ));
            }
        }
        if flags.contains(ServerStatusFlags::RELAY)
            && !(flags.contains(ServerStatusFlags::MASTER)
                && flags.contains(ServerStatusFlags::SLAVE))
        {
            violations.push(format!(
                "'{name}' is flagged relay without both master and slave"
            ));
        }
    }

    for violation in &violations {
        warn!("monitor invariant violated: {violation}");
    }
    violations
}
