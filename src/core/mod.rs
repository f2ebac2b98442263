// src/core/mod.rs

//! The proxy core: buffers, protocol, classification, routing and the
//! concurrency substrate.

pub mod buffer;
pub mod classifier;
pub mod errors;
pub mod filter;
pub mod monitor;
pub mod protocol;
pub mod router;
pub mod session;
pub mod shared;
pub mod state;
pub mod users;
pub mod worker;

pub use errors::SqlGateError;
