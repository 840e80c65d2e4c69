//! Consistent-hash (IP-hash) selection.
//!
//! A hash ring carries `150 × weight` virtual nodes per server; positions
//! are CRC32 of `"{server_id}:{i}"`. A lookup binary-searches for the first
//! position at or after the hash of the client IP (wrapping to zero) and
//! walks forward past unhealthy or capped servers. When nothing on the ring
//! is usable the strategy degrades to round-robin over the eligible set.
//!
//! The ring is immutable once built: membership or weight changes publish a
//! fresh ring through an atomic swap, so concurrent lookups never observe a
//! partial rebuild.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use arc_swap::ArcSwap;

use super::{LoadBalancer, SelectContext, exhaustion_error, weighted::membership_fingerprint};
use crate::core::{error::ProxyResult, model::Server};

const BASE_REPLICAS: u32 = 150;

struct HashRing {
    fingerprint: u64,
    /// (position, index into the server slice) sorted by position.
    points: Vec<(u32, usize)>,
}

impl HashRing {
    fn build(servers: &[Arc<Server>]) -> Self {
        let refs: Vec<&Arc<Server>> = servers.iter().collect();
        let mut points = Vec::new();
        for (idx, server) in servers.iter().enumerate() {
            let replicas = BASE_REPLICAS.saturating_mul(server.weight);
            for i in 0..replicas {
                let position = crc32fast::hash(format!("{}:{i}", server.id).as_bytes());
                points.push((position, idx));
            }
        }
        points.sort_unstable();
        Self {
            fingerprint: membership_fingerprint(&refs),
            points,
        }
    }

    /// First ring slot at or after `hash`, wrapping to zero.
    fn start_index(&self, hash: u32) -> usize {
        self.points.partition_point(|(position, _)| *position < hash) % self.points.len()
    }
}

pub struct IpHash {
    ring: ArcSwap<HashRing>,
    fallback_counter: AtomicUsize,
}

impl IpHash {
    pub fn new() -> Self {
        Self {
            ring: ArcSwap::from_pointee(HashRing {
                fingerprint: 0,
                points: Vec::new(),
            }),
            fallback_counter: AtomicUsize::new(0),
        }
    }

    fn ring_for(&self, servers: &[Arc<Server>]) -> Arc<HashRing> {
        let refs: Vec<&Arc<Server>> = servers.iter().collect();
        let fingerprint = membership_fingerprint(&refs);
        let current = self.ring.load_full();
        if current.fingerprint == fingerprint && !current.points.is_empty() {
            return current;
        }
        let fresh = Arc::new(HashRing::build(servers));
        self.ring.store(fresh.clone());
        fresh
    }

    fn fallback(&self, servers: &[Arc<Server>]) -> ProxyResult<Arc<Server>> {
        let eligible: Vec<&Arc<Server>> = servers.iter().filter(|s| s.is_eligible()).collect();
        if eligible.is_empty() {
            return Err(exhaustion_error(servers));
        }
        let idx = self.fallback_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(Arc::clone(eligible[idx]))
    }
}

impl Default for IpHash {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for IpHash {
    fn name(&self) -> &'static str {
        "ip_hash"
    }

    fn select(&self, ctx: &SelectContext<'_>, servers: &[Arc<Server>]) -> ProxyResult<Arc<Server>> {
        if servers.is_empty() {
            return Err(exhaustion_error(servers));
        }

        let Some(client_ip) = ctx.client_ip else {
            // No usable key; behave like round-robin rather than pinning
            // every keyless request to one server.
            return self.fallback(servers);
        };

        let ring = self.ring_for(servers);
        if ring.points.is_empty() {
            return self.fallback(servers);
        }

        // Walk forward from the key's position; each distinct server is
        // tried once, so the owner comes first and unhealthy or capped
        // owners hand off to their ring successor.
        let key_hash = crc32fast::hash(client_ip.to_string().as_bytes());
        let start = ring.start_index(key_hash);
        let mut tried = Vec::new();
        for offset in 0..ring.points.len() {
            let (_, idx) = ring.points[(start + offset) % ring.points.len()];
            if tried.contains(&idx) {
                continue;
            }
            tried.push(idx);
            let candidate = &servers[idx];
            if candidate.is_eligible() {
                return Ok(Arc::clone(candidate));
            }
            if tried.len() == servers.len() {
                break;
            }
        }
        self.fallback(servers)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::core::{
        balancer::testing::{mark_unhealthy, pool},
        error::ProxyError,
        health::HealthRegistry,
    };

    fn addr(ip: &str) -> Option<IpAddr> {
        Some(ip.parse().unwrap())
    }

    #[test]
    fn same_ip_maps_to_same_server() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[
                ("http://10.0.0.1:8080", 1, 0),
                ("http://10.0.0.2:8080", 1, 0),
                ("http://10.0.0.3:8080", 1, 0),
            ],
        );
        let lb = IpHash::new();
        let headers = http::HeaderMap::new();
        let ctx = SelectContext::new(addr("203.0.113.7"), &headers);

        let first = lb.select(&ctx, &servers).unwrap().id.clone();
        for _ in 0..9 {
            assert_eq!(lb.select(&ctx, &servers).unwrap().id, first);
        }
    }

    #[test]
    fn removing_a_server_only_moves_its_keys() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[
                ("http://10.0.0.1:8080", 1, 0),
                ("http://10.0.0.2:8080", 1, 0),
                ("http://10.0.0.3:8080", 1, 0),
            ],
        );
        let lb = IpHash::new();
        let headers = http::HeaderMap::new();

        let keys: Vec<String> = (0..64).map(|i| format!("10.1.{}.{}", i / 8, i % 8)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|key| {
                let ctx = SelectContext::new(addr(key), &headers);
                lb.select(&ctx, &servers).unwrap().id.clone()
            })
            .collect();

        // Drop the last server from the pool entirely.
        let removed_id = servers[2].id.clone();
        let remaining = servers[..2].to_vec();
        let after: Vec<String> = keys
            .iter()
            .map(|key| {
                let ctx = SelectContext::new(addr(key), &headers);
                lb.select(&ctx, &remaining).unwrap().id.clone()
            })
            .collect();

        for (prev, next) in before.iter().zip(after.iter()) {
            if prev != &removed_id {
                assert_eq!(prev, next, "keys on surviving servers must not move");
            }
        }
    }

    #[test]
    fn unhealthy_server_walks_to_next_on_ring() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[("http://10.0.0.1:8080", 1, 0), ("http://10.0.0.2:8080", 1, 0)],
        );
        let lb = IpHash::new();
        let headers = http::HeaderMap::new();
        let ctx = SelectContext::new(addr("203.0.113.7"), &headers);

        let first = lb.select(&ctx, &servers).unwrap();
        let other = servers
            .iter()
            .find(|s| s.id != first.id)
            .unwrap()
            .id
            .clone();
        mark_unhealthy(&registry, &first);

        for _ in 0..5 {
            assert_eq!(lb.select(&ctx, &servers).unwrap().id, other);
        }
    }

    #[test]
    fn no_healthy_servers_errors() {
        let registry = HealthRegistry::default();
        let servers = pool(&registry, &[("http://10.0.0.1:8080", 1, 0)]);
        mark_unhealthy(&registry, &servers[0]);
        let lb = IpHash::new();
        let headers = http::HeaderMap::new();
        let ctx = SelectContext::new(addr("203.0.113.7"), &headers);

        assert!(matches!(
            lb.select(&ctx, &servers),
            Err(ProxyError::NoHealthyBackends)
        ));
    }

    #[test]
    fn zero_weight_server_gets_no_ring_points() {
        let registry = HealthRegistry::default();
        let servers = pool(
            &registry,
            &[("http://10.0.0.1:8080", 0, 0), ("http://10.0.0.2:8080", 1, 0)],
        );
        let lb = IpHash::new();
        let headers = http::HeaderMap::new();

        for i in 0..16 {
            let ctx = SelectContext::new(addr(&format!("10.2.0.{i}")), &headers);
            assert_eq!(lb.select(&ctx, &servers).unwrap().id, servers[1].id);
        }
    }
}
