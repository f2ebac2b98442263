// src/core/router/select.rs

//! Backend selection criteria.
//!
//! Given the set of eligible candidates, a criterion picks one. Ties are
//! always broken by server name so that routing decisions are reproducible
//! in tests and across restarts.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::state::Server;

/// The configured selection criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectCriteria {
    /// Fewest currently open connections.
    #[default]
    LeastCurrentConnections,
    /// Lowest smoothed response latency.
    AdaptiveRouting,
    /// Least behind on GTID, by reported replication lag.
    LeastBehindMaster,
    /// Rotate through the candidates.
    RoundRobin,
}

/// One selectable candidate with the live attributes selection looks at.
pub struct Candidate {
    pub server: Arc<Server>,
    pub replication_lag: i64,
}

/// Picks one candidate per the criterion. `round_robin_counter` advances
/// only for the RoundRobin criterion.
pub fn select<'a>(
    criteria: SelectCriteria,
    candidates: &'a [Candidate],
    round_robin_counter: &mut usize,
) -> Option<&'a Candidate> {
    if candidates.is_empty() {
        return None;
    }
    let pick = match criteria {
        SelectCriteria::LeastCurrentConnections => candidates
            .iter()
            .min_by(|a, b| {
                a.server
                    .connections()
                    .cmp(&b.server.connections())
                    .then_with(|| a.server.name.cmp(&b.server.name))
            })?,
        SelectCriteria::AdaptiveRouting => candidates
            .iter()
            .min_by(|a, b| {
                latency_key(&a.server)
                    .cmp(&latency_key(&b.server))
                    .then_with(|| a.server.name.cmp(&b.server.name))
            })?,
        SelectCriteria::LeastBehindMaster => candidates
            .iter()
            .min_by(|a, b| {
                lag_key(a)
                    .cmp(&lag_key(b))
                    .then_with(|| a.server.name.cmp(&b.server.name))
            })?,
        SelectCriteria::RoundRobin => {
            // Deterministic order first, then rotate.
            let mut ordered: Vec<&Candidate> = candidates.iter().collect();
            ordered.sort_by(|a, b| a.server.name.cmp(&b.server.name));
            let pick = ordered[*round_robin_counter % ordered.len()];
            *round_robin_counter += 1;
            pick
        }
    };
    Some(pick)
}

fn latency_key(server: &Server) -> Duration {
    server.avg_latency()
}

fn lag_key(candidate: &Candidate) -> i64 {
    // Unknown lag sorts last.
    if candidate.replication_lag < 0 {
        i64::MAX
    } else {
        candidate.replication_lag
    }
}
