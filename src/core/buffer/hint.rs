// src/core/buffer/hint.rs

//! Routing hints attached to a buffer by listeners and filters.
//!
//! Hints ride along with the buffer and are consulted by the classifier
//! when it computes the routing target. They are ordered: the first
//! applicable hint wins.

/// A single routing hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingHint {
    /// Route to the current master.
    Master,
    /// Route to any eligible slave.
    Slave,
    /// Route to the named server.
    Named(String),
    /// Route to any slave whose replication lag is at most this many seconds.
    MaxReplicationLag(i64),
    /// Route to the server the previous statement was routed to.
    LastUsed,
}
