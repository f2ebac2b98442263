// src/core/worker/pool.rs

//! The per-worker persistent backend pool.
//!
//! Instead of being destroyed, a cleanly closed backend connection may be
//! parked here keyed by (server, user) with an insertion timestamp. A later
//! outbound connect can check out a parked entry whose age is within the
//! TTL and whose session-state imprint matches; everything else is evicted
//! by the owning worker during idle ticks. Entries never cross workers.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

/// The session state a parked connection still carries. A checkout must
/// match it exactly; replaying state onto a mismatched connection would be
/// slower than opening a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionImprint {
    pub user: String,
    pub db: Option<String>,
    pub charset: u8,
}

/// One parked backend connection.
pub struct Parked<B> {
    pub entry: B,
    pub imprint: SessionImprint,
    parked_at: Instant,
}

impl<B> Parked<B> {
    pub fn age(&self) -> Duration {
        self.parked_at.elapsed()
    }
}

/// Idle backend connections of one worker.
pub struct PersistentPool<B> {
    entries: HashMap<(String, String), VecDeque<Parked<B>>>,
    ttl: Duration,
    max_per_key: usize,
}

impl<B> PersistentPool<B> {
    pub fn new(ttl: Duration, max_per_key: usize) -> Self {
        PersistentPool {
            entries: HashMap::new(),
            ttl,
            max_per_key,
        }
    }

    /// Parks a backend. Returns the entry back to the caller (for closing)
    /// when the slot for this (server, user) is full or pooling is
    /// disabled.
    pub fn park(&mut self, server: &str, entry: B, imprint: SessionImprint) -> Result<(), B> {
        if self.max_per_key == 0 || self.ttl.is_zero() {
            return Err(entry);
        }
        let key = (server.to_string(), imprint.user.clone());
        let slot = self.entries.entry(key).or_default();
        if slot.len() >= self.max_per_key {
            return Err(entry);
        }
        slot.push_back(Parked {
            entry,
            imprint,
            parked_at: Instant::now(),
        });
        Ok(())
    }

    /// Checks out the freshest parked connection for (server, user) whose
    /// age is within the TTL, whose imprint matches and which passes the
    /// caller's liveness check. Entries failing age or liveness are
    /// dropped on the way.
    pub fn check_out(
        &mut self,
        server: &str,
        imprint: &SessionImprint,
        alive: impl Fn(&B) -> bool,
    ) -> Option<B> {
        let key = (server.to_string(), imprint.user.clone());
        let slot = self.entries.get_mut(&key)?;
        while let Some(parked) = slot.pop_back() {
            if parked.age() > self.ttl || !alive(&parked.entry) {
                debug!(server, user = %imprint.user, "dropping unusable pooled connection");
                continue;
            }
            if &parked.imprint != imprint {
                // Wrong db/charset imprint; put it back for an exact match
                // and open a fresh connection instead.
                slot.push_front(parked);
                return None;
            }
            return Some(parked.entry);
        }
        None
    }

    /// Idle-tick eviction of entries past the TTL. Returns how many were
    /// dropped.
    pub fn evict_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let mut evicted = 0;
        self.entries.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|p| p.age() <= ttl);
            evicted += before - slot.len();
            !slot.is_empty()
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
