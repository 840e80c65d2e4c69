//! Runtime server pools, materialized per service.
//!
//! Servers are created on demand from a service's endpoints and kept across
//! requests so their connection counters and health handles stay live. A
//! pool is rebuilt when the service's endpoint set, weight or cap changes
//! (detected by fingerprint); catalog delete events evict it.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::core::{
    health::HealthRegistry,
    model::{Server, Service},
};

struct PoolEntry {
    fingerprint: u64,
    servers: Arc<Vec<Arc<Server>>>,
}

pub struct ServerPool {
    registry: Arc<HealthRegistry>,
    pools: RwLock<HashMap<String, PoolEntry>>,
}

impl ServerPool {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self {
            registry,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// The live server set for a service, rebuilding if the service changed
    /// since the last materialization.
    pub fn servers_for(&self, service: &Service) -> Arc<Vec<Arc<Server>>> {
        let fingerprint = service.pool_fingerprint();
        if let Some(entry) = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&service.id)
            && entry.fingerprint == fingerprint
        {
            return entry.servers.clone();
        }

        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        // Double-checked: another writer may have rebuilt while we waited.
        if let Some(entry) = pools.get(&service.id)
            && entry.fingerprint == fingerprint
        {
            return entry.servers.clone();
        }

        let fresh = Arc::new(Server::materialize(service, &self.registry));
        let stale_ids: Vec<String> = pools
            .get(&service.id)
            .map(|entry| {
                entry
                    .servers
                    .iter()
                    .filter(|old| !fresh.iter().any(|new| new.id == old.id))
                    .map(|old| old.id.clone())
                    .collect()
            })
            .unwrap_or_default();
        pools.insert(
            service.id.clone(),
            PoolEntry {
                fingerprint,
                servers: fresh.clone(),
            },
        );
        drop(pools);

        for id in stale_ids {
            self.registry.untrack(&id);
        }
        fresh
    }

    /// Evict a deleted service's pool. Returns the ids of its servers so
    /// callers can purge dependent state (sticky sessions, health entries).
    pub fn remove_service(&self, service_id: &str) -> Vec<String> {
        let removed = self
            .pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service_id);
        let ids: Vec<String> = removed
            .map(|entry| entry.servers.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default();
        for id in &ids {
            self.registry.untrack(id);
        }
        ids
    }

    /// Ids of servers that would be dropped by rebuilding against `service`.
    pub fn stale_servers(&self, service: &Service) -> Vec<String> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = pools.get(&service.id) else {
            return Vec::new();
        };
        entry
            .servers
            .iter()
            .filter(|old| {
                !service
                    .endpoints
                    .iter()
                    .any(|endpoint| old.id == format!("{}:{endpoint}", service.id))
            })
            .map(|old| old.id.clone())
            .collect()
    }

    pub fn tracked_services(&self) -> usize {
        self.pools.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
