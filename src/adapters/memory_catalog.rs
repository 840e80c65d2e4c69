//! In-memory catalog store.
//!
//! Services and routes live in reader/writer-locked maps; every mutation is
//! fanned out to watch subscribers over bounded queues. A subscriber that
//! cannot keep up loses events (drop-newest) instead of blocking the
//! mutator — consumers treat events as hints and reconcile via `list_*`.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, mpsc};

use crate::{
    core::{
        error::{ProxyError, ProxyResult},
        model::{Route, Service},
    },
    ports::catalog::{CatalogObject, CatalogStore, ChangeKind, StorageEvent},
};

/// Queue depth per watch subscriber.
const SUBSCRIBER_BUFFER: usize = 64;

pub struct MemoryCatalog {
    services: RwLock<HashMap<String, Service>>,
    routes: RwLock<HashMap<String, Route>>,
    subscribers: Mutex<Vec<mpsc::Sender<StorageEvent>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Load the startup seed without emitting events (nobody is watching
    /// yet, and the consumers do an initial reconcile anyway).
    pub async fn seed(&self, services: Vec<Service>, routes: Vec<Route>) -> ProxyResult<()> {
        {
            let mut map = self.services.write().await;
            for service in services {
                validate_service(&service)?;
                map.insert(service.id.clone(), service);
            }
        }
        {
            let services = self.services.read().await;
            let mut map = self.routes.write().await;
            for route in routes {
                if !services.contains_key(&route.service_id) {
                    return Err(ProxyError::ServiceNotFound(route.service_id));
                }
                map.insert(route.id.clone(), route);
            }
        }
        Ok(())
    }

    fn publish(&self, change: ChangeKind, object: CatalogObject) {
        let event = StorageEvent {
            change,
            id: object.id().to_string(),
            object,
        };
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow subscriber: drop this event, keep the subscription.
                tracing::debug!(id = %event.id, "watch subscriber full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_service(service: &Service) -> ProxyResult<()> {
    if service.id.is_empty() {
        return Err(ProxyError::InvalidRequest("service id is required".into()));
    }
    if service.endpoints.is_empty() {
        return Err(ProxyError::InvalidRequest(format!(
            "service '{}' must have at least one endpoint",
            service.id
        )));
    }
    Ok(())
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn get_service(&self, id: &str) -> ProxyResult<Service> {
        self.services
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::ServiceNotFound(id.to_string()))
    }

    async fn list_services(&self) -> ProxyResult<Vec<Service>> {
        let mut services: Vec<Service> = self.services.read().await.values().cloned().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }

    async fn create_service(&self, mut service: Service) -> ProxyResult<()> {
        validate_service(&service)?;
        let mut map = self.services.write().await;
        if map.contains_key(&service.id) {
            return Err(ProxyError::AlreadyExists {
                kind: "service",
                id: service.id,
            });
        }
        service.created_at = Utc::now();
        service.updated_at = service.created_at;
        let stored = service.clone();
        map.insert(service.id.clone(), service);
        drop(map);
        self.publish(ChangeKind::Created, CatalogObject::Service(stored));
        Ok(())
    }

    async fn update_service(&self, mut service: Service) -> ProxyResult<()> {
        validate_service(&service)?;
        let mut map = self.services.write().await;
        let Some(existing) = map.get(&service.id) else {
            return Err(ProxyError::ServiceNotFound(service.id));
        };
        service.created_at = existing.created_at;
        service.updated_at = Utc::now();
        let stored = service.clone();
        map.insert(service.id.clone(), service);
        drop(map);
        self.publish(ChangeKind::Updated, CatalogObject::Service(stored));
        Ok(())
    }

    async fn delete_service(&self, id: &str) -> ProxyResult<()> {
        let removed = self
            .services
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ProxyError::ServiceNotFound(id.to_string()))?;
        self.publish(ChangeKind::Deleted, CatalogObject::Service(removed));
        Ok(())
    }

    async fn get_route(&self, id: &str) -> ProxyResult<Route> {
        self.routes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::Storage(format!("route not found: {id}")))
    }

    async fn list_routes(&self) -> ProxyResult<Vec<Route>> {
        let mut routes: Vec<Route> = self.routes.read().await.values().cloned().collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(routes)
    }

    async fn create_route(&self, route: Route) -> ProxyResult<()> {
        if !self.services.read().await.contains_key(&route.service_id) {
            return Err(ProxyError::ServiceNotFound(route.service_id));
        }
        let mut map = self.routes.write().await;
        if map.contains_key(&route.id) {
            return Err(ProxyError::AlreadyExists {
                kind: "route",
                id: route.id,
            });
        }
        let stored = route.clone();
        map.insert(route.id.clone(), route);
        drop(map);
        self.publish(ChangeKind::Created, CatalogObject::Route(stored));
        Ok(())
    }

    async fn update_route(&self, route: Route) -> ProxyResult<()> {
        if !self.services.read().await.contains_key(&route.service_id) {
            return Err(ProxyError::ServiceNotFound(route.service_id));
        }
        let mut map = self.routes.write().await;
        if !map.contains_key(&route.id) {
            return Err(ProxyError::Storage(format!("route not found: {}", route.id)));
        }
        let stored = route.clone();
        map.insert(route.id.clone(), route);
        drop(map);
        self.publish(ChangeKind::Updated, CatalogObject::Route(stored));
        Ok(())
    }

    async fn delete_route(&self, id: &str) -> ProxyResult<()> {
        let removed = self
            .routes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ProxyError::Storage(format!("route not found: {id}")))?;
        self.publish(ChangeKind::Deleted, CatalogObject::Route(removed));
        Ok(())
    }

    fn watch(&self) -> mpsc::Receiver<StorageEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;

    fn service(id: &str) -> Service {
        Service {
            id: id.into(),
            name: id.into(),
            endpoints: vec!["http://10.0.0.1:8080".into()],
            health_path: "/health".into(),
            weight: 1,
            max_conns_per_endpoint: 0,
            timeout_secs: 30,
            metadata: StdHashMap::new(),
            tls: None,
            strip_prefix: false,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn route(id: &str, service_id: &str) -> Route {
        Route {
            id: id.into(),
            priority: 0,
            host: None,
            path_prefix: Some("/".into()),
            path_regex: None,
            headers: StdHashMap::new(),
            service_id: service_id.into(),
            middlewares: Vec::new(),
            rewrite_rules: Vec::new(),
            preserve_host: false,
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let catalog = MemoryCatalog::new();
        catalog.create_service(service("s1")).await.unwrap();
        assert!(matches!(
            catalog.create_service(service("s1")).await,
            Err(ProxyError::AlreadyExists { .. })
        ));

        let fetched = catalog.get_service("s1").await.unwrap();
        assert_eq!(fetched.endpoints.len(), 1);

        let mut changed = fetched.clone();
        changed.weight = 5;
        catalog.update_service(changed).await.unwrap();
        assert_eq!(catalog.get_service("s1").await.unwrap().weight, 5);

        catalog.create_route(route("r1", "s1")).await.unwrap();
        assert_eq!(catalog.list_routes().await.unwrap().len(), 1);

        catalog.delete_route("r1").await.unwrap();
        catalog.delete_service("s1").await.unwrap();
        assert!(matches!(
            catalog.get_service("s1").await,
            Err(ProxyError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn route_requires_existing_service() {
        let catalog = MemoryCatalog::new();
        assert!(matches!(
            catalog.create_route(route("r1", "nope")).await,
            Err(ProxyError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn service_without_endpoints_is_rejected() {
        let catalog = MemoryCatalog::new();
        let mut bad = service("s1");
        bad.endpoints.clear();
        assert!(matches!(
            catalog.create_service(bad).await,
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn watch_receives_events() {
        let catalog = MemoryCatalog::new();
        let mut rx = catalog.watch();

        catalog.create_service(service("s1")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.change, ChangeKind::Created);
        assert_eq!(event.id, "s1");
        assert!(matches!(event.object, CatalogObject::Service(_)));

        catalog.delete_service("s1").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.change, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events_without_blocking() {
        let catalog = MemoryCatalog::new();
        let mut rx = catalog.watch();

        // Overflow the bounded queue; mutators must not block.
        for i in 0..(SUBSCRIBER_BUFFER + 16) {
            catalog.create_service(service(&format!("s{i}"))).await.unwrap();
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);

        // The subscription stays live for later events.
        catalog.delete_service("s0").await.unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
