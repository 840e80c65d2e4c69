//! Smooth weighted round-robin.
//!
//! Per call, every eligible server gains `effective_weight` on its current
//! weight; the server with the highest current weight is chosen and pays
//! back the total. Unlike expansion WRR this interleaves picks instead of
//! bursting a heavy server, which is why it backs the `weighted` algorithm.

use std::sync::{Arc, Mutex};

use super::{LoadBalancer, SelectContext, exhaustion_error};
use crate::core::{error::ProxyResult, model::Server};

#[derive(Default)]
struct SmoothState {
    /// (server id, effective weight) in insertion order; detects membership
    /// or weight churn.
    members: Vec<(String, i64)>,
    current: Vec<i64>,
}

pub struct SmoothWeightedRoundRobin {
    state: Mutex<SmoothState>,
}

impl SmoothWeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SmoothState::default()),
        }
    }
}

impl Default for SmoothWeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for SmoothWeightedRoundRobin {
    fn name(&self) -> &'static str {
        "smooth_weighted_round_robin"
    }

    fn select(
        &self,
        _ctx: &SelectContext<'_>,
        servers: &[Arc<Server>],
    ) -> ProxyResult<Arc<Server>> {
        let eligible: Vec<&Arc<Server>> = servers.iter().filter(|s| s.is_eligible()).collect();
        if eligible.is_empty() {
            return Err(exhaustion_error(servers));
        }

        let any_positive = eligible.iter().any(|s| s.weight > 0);
        let members: Vec<(String, i64)> = eligible
            .iter()
            .map(|s| {
                let effective = if any_positive { s.weight as i64 } else { 1 };
                (s.id.clone(), effective)
            })
            .collect();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.members != members {
            state.members = members;
            state.current = vec![0; eligible.len()];
        }

        let mut total_weight = 0i64;
        let mut best_idx = 0usize;
        let mut best_val = i64::MIN;
        for i in 0..eligible.len() {
            let effective = state.members[i].1;
            total_weight += effective;
            state.current[i] += effective;
            // Strict comparison keeps ties on the earliest-inserted server.
            if state.current[i] > best_val {
                best_val = state.current[i];
                best_idx = i;
            }
        }
        state.current[best_idx] -= total_weight;

        Ok(Arc::clone(eligible[best_idx]))
    }
}
