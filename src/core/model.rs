//! Catalog data model and the runtime server instance.
//!
//! [`Service`] and [`Route`] are the persisted catalog records (serde
//! friendly, mutated only through the catalog store). [`Server`] is the
//! runtime materialization of one service endpoint: it carries the live
//! connection counter and a shared handle to its health state, and is never
//! persisted.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::health::{HealthInfo, HealthRegistry};

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_active() -> bool {
    true
}

/// Backend TLS knobs for a service whose endpoints use `https`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendTls {
    /// SNI override; defaults to the endpoint host
    pub server_name: Option<String>,
    /// Additional PEM bundle of trusted roots
    pub root_ca_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    /// Disable certificate verification (testing only)
    pub insecure_skip_verify: bool,
}

/// A logical backend: one or more equivalent endpoints behind a stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Ordered endpoint URLs; must be non-empty
    pub endpoints: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Max concurrent connections per endpoint; 0 = unlimited
    #[serde(default)]
    pub max_conns_per_endpoint: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tls: Option<BackendTls>,
    /// Strip the matched route prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Service {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fingerprint over everything that shapes the materialized server set.
    pub fn pool_fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.endpoints.hash(&mut hasher);
        self.weight.hash(&mut hasher);
        self.max_conns_per_endpoint.hash(&mut hasher);
        self.active.hash(&mut hasher);
        hasher.finish()
    }
}

/// How a single rewrite rule transforms the request path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewriteKind {
    Regex,
    Prefix,
    StripPrefix,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteRule {
    #[serde(rename = "type")]
    pub kind: RewriteKind,
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

/// A matching rule directing requests to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    /// Higher priority wins among matching routes
    #[serde(default)]
    pub priority: i32,
    /// Exact host or `*.suffix` wildcard; empty/absent matches any host
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Full-match regex over the request path
    #[serde(default)]
    pub path_regex: Option<String>,
    /// Header equality predicates; all must match
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub service_id: String,
    /// Informational for the data plane
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub rewrite_rules: Vec<RewriteRule>,
    /// Keep the original Host header on the forwarded request
    #[serde(default)]
    pub preserve_host: bool,
}

/// Runtime instance of a single service endpoint.
#[derive(Debug)]
pub struct Server {
    /// `"{service_id}:{endpoint}"`
    pub id: String,
    pub service_id: String,
    pub url: Url,
    pub weight: u32,
    /// 0 = unlimited
    pub max_conns: usize,
    pub metadata: HashMap<String, String>,
    active_conns: AtomicUsize,
    last_used: AtomicU64,
    health: Arc<HealthInfo>,
}

impl Server {
    /// Materialize the runtime servers for a service, skipping endpoints
    /// whose URL does not parse.
    pub fn materialize(service: &Service, registry: &HealthRegistry) -> Vec<Arc<Server>> {
        service
            .endpoints
            .iter()
            .filter_map(|endpoint| {
                let url = match Url::parse(endpoint) {
                    Ok(url) if url.host_str().is_some() => url,
                    Ok(_) => {
                        tracing::warn!(service = %service.id, endpoint, "endpoint URL has no host, skipping");
                        return None;
                    }
                    Err(e) => {
                        tracing::warn!(service = %service.id, endpoint, error = %e, "invalid endpoint URL, skipping");
                        return None;
                    }
                };
                let id = format!("{}:{}", service.id, endpoint);
                let health = registry.track(&id);
                Some(Arc::new(Server {
                    id,
                    service_id: service.id.clone(),
                    url,
                    weight: service.weight,
                    max_conns: service.max_conns_per_endpoint,
                    metadata: service.metadata.clone(),
                    active_conns: AtomicUsize::new(0),
                    last_used: AtomicU64::new(0),
                    health,
                }))
            })
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn active_conns(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    /// Whether the server can take one more connection.
    pub fn has_capacity(&self) -> bool {
        self.max_conns == 0 || self.active_conns() < self.max_conns
    }

    /// Healthy and below its connection cap.
    pub fn is_eligible(&self) -> bool {
        self.is_healthy() && self.has_capacity()
    }

    pub fn last_used_unix(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// Take a connection slot. The returned guard releases it on drop, so
    /// the count is conserved on success, error and cancellation paths.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.active_conns.fetch_add(1, Ordering::AcqRel);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_used.store(now, Ordering::Relaxed);
        ConnectionGuard {
            server: self.clone(),
        }
    }
}

/// RAII decrement for [`Server::active_conns`].
pub struct ConnectionGuard {
    server: Arc<Server>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.server.active_conns.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service(endpoints: &[&str]) -> Service {
        Service {
            id: "s1".into(),
            name: "test".into(),
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            health_path: default_health_path(),
            weight: 2,
            max_conns_per_endpoint: 1,
            timeout_secs: 30,
            metadata: HashMap::new(),
            tls: None,
            strip_prefix: false,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn materialize_skips_invalid_endpoints() {
        let registry = HealthRegistry::default();
        let service = test_service(&["http://10.0.0.1:8080", "not a url", "http://10.0.0.2:8080"]);
        let servers = Server::materialize(&service, &registry);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].id, "s1:http://10.0.0.1:8080");
        assert_eq!(servers[0].weight, 2);
    }

    #[test]
    fn connection_guard_conserves_count() {
        let registry = HealthRegistry::default();
        let service = test_service(&["http://10.0.0.1:8080"]);
        let servers = Server::materialize(&service, &registry);
        let server = &servers[0];

        assert!(server.has_capacity());
        {
            let _guard = server.acquire();
            assert_eq!(server.active_conns(), 1);
            assert!(!server.has_capacity());
        }
        assert_eq!(server.active_conns(), 0);
        assert!(server.has_capacity());
    }

    #[test]
    fn pool_fingerprint_tracks_endpoint_changes() {
        let a = test_service(&["http://10.0.0.1:8080"]);
        let mut b = a.clone();
        assert_eq!(a.pool_fingerprint(), b.pool_fingerprint());
        b.endpoints.push("http://10.0.0.2:8080".into());
        assert_ne!(a.pool_fingerprint(), b.pool_fingerprint());
    }
}
