//! Least-connections selection with fair tie rotation.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use super::{LoadBalancer, SelectContext, exhaustion_error};
use crate::core::{error::ProxyResult, model::Server};

pub struct LeastConnections {
    /// Rotates among equally-loaded servers so idle pools stay fair.
    tie_counter: AtomicUsize,
    /// Divide the load by `max(weight, 1)` before comparing.
    weighted: bool,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            tie_counter: AtomicUsize::new(0),
            weighted: false,
        }
    }

    pub fn weighted() -> Self {
        Self {
            tie_counter: AtomicUsize::new(0),
            weighted: true,
        }
    }

    fn load_of(&self, server: &Server) -> f64 {
        let conns = server.active_conns() as f64;
        if self.weighted {
            conns / server.weight.max(1) as f64
        } else {
            conns
        }
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnections {
    fn name(&self) -> &'static str {
        if self.weighted {
            "weighted_least_connections"
        } else {
            "least_connections"
        }
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

        let mut min_load = f64::INFINITY;
        let mut ties: Vec<&Arc<Server>> = Vec::new();
        for server in eligible {
            let load = self.load_of(server);
            if load < min_load {
                min_load = load;
                ties.clear();
                ties.push(server);
            } else if load == min_load {
                ties.push(server);
            }
        }

        let idx = self.tie_counter.fetch_add(1, Ordering::Relaxed) % ties.len();
        Ok(Arc::clone(ties[idx]))
    }
}
