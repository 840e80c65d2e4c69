//! Expansion weighted round-robin: each healthy server appears `weight`
//! times in an expanded slot list walked by one atomic counter.
//!
//! The slot list is rebuilt lazily when the healthy membership or weights
//! change, and published as an immutable snapshot so readers never observe a
//! half-built list.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use arc_swap::ArcSwap;

use super::{LoadBalancer, SelectContext, exhaustion_error};
use crate::core::{error::ProxyResult, model::Server};

struct SlotList {
    fingerprint: u64,
    /// Indexes into the healthy vector the fingerprint was computed from.
    slots: Vec<usize>,
}

pub struct WeightedRoundRobin {
    counter: AtomicUsize,
    expanded: ArcSwap<SlotList>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            expanded: ArcSwap::from_pointee(SlotList {
                fingerprint: 0,
                slots: Vec::new(),
            }),
        }
    }

    fn expansion(&self, healthy: &[&Arc<Server>]) -> Arc<SlotList> {
        let fingerprint = membership_fingerprint(healthy);
        let current = self.expanded.load_full();
        if current.fingerprint == fingerprint && !current.slots.is_empty() {
            return current;
        }

        let mut slots = Vec::new();
        for (idx, server) in healthy.iter().enumerate() {
            for _ in 0..server.weight {
                slots.push(idx);
            }
        }
        // All weights zero degenerates to plain round-robin.
        if slots.is_empty() {
            slots.extend(0..healthy.len());
        }
        let fresh = Arc::new(SlotList { fingerprint, slots });
        self.expanded.store(fresh.clone());
        fresh
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
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

        let expansion = self.expansion(&healthy);
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % expansion.slots.len();
        for offset in 0..expansion.slots.len() {
            let slot = expansion.slots[(start + offset) % expansion.slots.len()];
            let candidate = healthy[slot];
            if candidate.has_capacity() {
                return Ok(Arc::clone(candidate));
            }
        }
        Err(exhaustion_error(servers))
    }
}

pub(crate) fn membership_fingerprint(healthy: &[&Arc<Server>]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for server in healthy {
        server.id.hash(&mut hasher);
        server.weight.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::{
        balancer::testing::{mark_unhealthy, pool},
        health::HealthRegistry,
    };

    #[test]
    fn distribution_follows_weights() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[("http://10.0.0.1:8080", 3, 0), ("http://10.0.0.2:8080", 1, 0)],
        );
        let lb = WeightedRoundRobin::new();
        let headers = http::HeaderMap::new();
        let ctx = SelectContext::new(None, &headers);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..40 {
            let pick = lb.select(&ctx, &servers).unwrap();
            *counts.entry(pick.id.clone()).or_default() += 1;
        }
        assert_eq!(counts[&servers[0].id], 30);
        assert_eq!(counts[&servers[1].id], 10);
    }

    #[test]
    fn rebuilds_when_membership_changes() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[("http://10.0.0.1:8080", 2, 0), ("http://10.0.0.2:8080", 2, 0)],
        );
        let lb = WeightedRoundRobin::new();
        let headers = http::HeaderMap::new();
        let ctx = SelectContext::new(None, &headers);

        lb.select(&ctx, &servers).unwrap();
        mark_unhealthy(&registry, &servers[0]);
        for _ in 0..4 {
            assert_eq!(lb.select(&ctx, &servers).unwrap().id, servers[1].id);
        }
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[("http://10.0.0.1:8080", 0, 0), ("http://10.0.0.2:8080", 0, 0)],
        );
        let lb = WeightedRoundRobin::new();
        let headers = http::HeaderMap::new();
        let ctx = SelectContext::new(None, &headers);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(lb.select(&ctx, &servers).unwrap().id.clone());
        }
        assert_eq!(seen.len(), 2);
    }
}
