//! The load-balancer family.
//!
//! Every strategy implements [`LoadBalancer`]: pick one server from the live
//! set for a service, filtering on health and connection capacity. The
//! [`sticky::StickySessions`] decorator layers session affinity over any
//! strategy.
//!
//! Invariants common to all strategies: never return an unhealthy server,
//! never exceed a positive connection cap, and for identical input state the
//! choice is deterministic modulo the rotation counter.

use std::{net::IpAddr, sync::Arc};

use http::HeaderMap;

use crate::core::{
    error::{ProxyError, ProxyResult},
    model::Server,
};

pub mod ip_hash;
pub mod least_conn;
pub mod round_robin;
pub mod smooth;
pub mod sticky;
pub mod weighted;

pub use ip_hash::IpHash;
pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;
pub use smooth::SmoothWeightedRoundRobin;
pub use sticky::StickySessions;
pub use weighted::WeightedRoundRobin;

/// Per-request inputs a strategy may consult.
pub struct SelectContext<'a> {
    pub client_ip: Option<IpAddr>,
    pub headers: &'a HeaderMap,
}

impl<'a> SelectContext<'a> {
    pub fn new(client_ip: Option<IpAddr>, headers: &'a HeaderMap) -> Self {
        Self { client_ip, headers }
    }
}

/// A backend-selection strategy.
pub trait LoadBalancer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Pick a server from `servers`, or fail with `NoHealthyBackends` /
    /// `MaxConnectionsReached`.
    fn select(&self, ctx: &SelectContext<'_>, servers: &[Arc<Server>]) -> ProxyResult<Arc<Server>>;

    /// Hook invoked when a server leaves the pool (session purge etc.).
    fn forget_server(&self, _server_id: &str) {}
}

/// The right error when no server could be picked: capacity exhaustion only
/// if at least one server was healthy.
pub(crate) fn exhaustion_error(servers: &[Arc<Server>]) -> ProxyError {
    if servers.iter().any(|s| s.is_healthy()) {
        ProxyError::MaxConnectionsReached
    } else {
        ProxyError::NoHealthyBackends
    }
}

/// Supported balancing algorithms, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    /// Smooth weighted round-robin
    Weighted,
    LeastConn,
    IpHash,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::RoundRobin
    }
}

/// Build the strategy an [`Algorithm`] names.
pub fn build_balancer(algorithm: Algorithm) -> Arc<dyn LoadBalancer> {
    match algorithm {
        Algorithm::RoundRobin => Arc::new(RoundRobin::new()),
        Algorithm::Weighted => Arc::new(SmoothWeightedRoundRobin::new()),
        Algorithm::LeastConn => Arc::new(LeastConnections::new()),
        Algorithm::IpHash => Arc::new(IpHash::new()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::core::{health::HealthRegistry, model::Service};

    /// Build a pool of runtime servers for balancer tests. Endpoint i gets
    /// the weight at `weights[i]` by materializing one service per endpoint.
    pub fn pool(
        registry: &HealthRegistry,
        endpoints: &[(&str, u32, usize)],
    ) -> Vec<Arc<Server>> {
        endpoints
            .iter()
            .flat_map(|(endpoint, weight, max_conns)| {
                let service = Service {
                    id: "svc".into(),
                    name: "svc".into(),
                    endpoints: vec![endpoint.to_string()],
                    health_path: "/health".into(),
                    weight: *weight,
                    max_conns_per_endpoint: *max_conns,
                    timeout_secs: 30,
                    metadata: HashMap::new(),
                    tls: None,
                    strip_prefix: false,
                    active: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                Server::materialize(&service, registry)
            })
            .collect()
    }

    pub fn mark_unhealthy(registry: &HealthRegistry, server: &Server) {
        let t = registry.thresholds();
        for _ in 0..t.fail_threshold {
            registry.record_failure(&server.id, "test");
        }
    }
}
