//! Round-robin selection: a monotonic atomic counter over the healthy set.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use super::{LoadBalancer, SelectContext, exhaustion_error};
use crate::core::{error::ProxyResult, model::Server};

pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(
        &self,
        _ctx: &SelectContext<'_>,
        servers: &[Arc<Server>],
    ) -> ProxyResult<Arc<Server>> {
        let healthy: Vec<&Arc<Server>> = servers.iter().filter(|s| s.is_healthy()).collect();
        if healthy.is_empty() {
            return Err(exhaustion_error(servers));
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        // If the nominated server is at its cap, scan forward for the next
        // one with room.
        for offset in 0..healthy.len() {
            let candidate = healthy[(start + offset) % healthy.len()];
            if candidate.has_capacity() {
                return Ok(Arc::clone(candidate));
            }
        }
        Err(exhaustion_error(servers))
    }
}
