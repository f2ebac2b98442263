// src/core/errors.rs

//! Defines the primary error type for the entire proxy.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations. `std::io::Error` is wrapped in an `Arc` so the enum
/// stays cheaply cloneable.
#[derive(Error, Debug, Clone)]
pub enum SqlGateError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected packet sequence: expected {expected}, got {got}")]
    UnexpectedSequence { expected: u8, got: u8 },

    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Authentication failed ({code}): {message}")]
    Auth { code: u16, message: String },

    #[error("Buffer underflow")]
    Underflow,

    #[error("Worker message queue is full")]
    QueueFull,

    #[error("Connection closed by peer")]
    Hangup,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No valid backend available: {0}")]
    NoBackend(String),

    #[error("Routing failed: {0}")]
    RoutingFailed(String),

    #[error("Result checksum mismatch")]
    ChecksumMismatch,

    #[error("Session command replay diverged on '{0}'")]
    HistoryDivergence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Session killed by administrator")]
    Killed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SqlGateError {
    fn from(e: std::io::Error) -> Self {
        SqlGateError::Io(Arc::new(e))
    }
}

impl From<regex::Error> for SqlGateError {
    fn from(e: regex::Error) -> Self {
        SqlGateError::Config(format!("invalid regex: {e}"))
    }
}

impl From<mlua::Error> for SqlGateError {
    fn from(e: mlua::Error) -> Self {
        SqlGateError::Script(e.to_string())
    }
}

impl From<std::net::AddrParseError> for SqlGateError {
    fn from(e: std::net::AddrParseError) -> Self {
        SqlGateError::Config(format!("invalid address: {e}"))
    }
}

impl SqlGateError {
    /// True when the error indicates a peer-initiated disconnect rather than
    /// a fault in the proxy itself.
    pub fn is_hangup(&self) -> bool {
        match self {
            SqlGateError::Hangup => true,
            SqlGateError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
