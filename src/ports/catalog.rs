//! Catalog port: the mutable service/route store the data plane consumes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{
    error::ProxyResult,
    model::{Route, Service},
};

/// What changed in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// The record the change applies to. Deleted events carry the last known
/// state of the object.
#[derive(Debug, Clone)]
pub enum CatalogObject {
    Service(Service),
    Route(Route),
}

impl CatalogObject {
    pub fn id(&self) -> &str {
        match self {
            CatalogObject::Service(s) => &s.id,
            CatalogObject::Route(r) => &r.id,
        }
    }
}

/// One entry on the catalog's change stream.
///
/// Events are hints, not the source of truth: the fan-out uses a bounded
/// per-subscriber queue and drops when a subscriber falls behind, so
/// consumers reconcile against `list_*` when they wake.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub change: ChangeKind,
    pub id: String,
    pub object: CatalogObject,
}

/// Read/mutate services and routes; emit change events.
///
/// The catalog is the sole mutator of [`Service`] and [`Route`] records.
/// All methods are cancel-safe: dropping the future abandons the call.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    async fn get_service(&self, id: &str) -> ProxyResult<Service>;
    async fn list_services(&self) -> ProxyResult<Vec<Service>>;
    async fn create_service(&self, service: Service) -> ProxyResult<()>;
    async fn update_service(&self, service: Service) -> ProxyResult<()>;
    async fn delete_service(&self, id: &str) -> ProxyResult<()>;

    async fn get_route(&self, id: &str) -> ProxyResult<Route>;
    async fn list_routes(&self) -> ProxyResult<Vec<Route>>;
    async fn create_route(&self, route: Route) -> ProxyResult<()>;
    async fn update_route(&self, route: Route) -> ProxyResult<()>;
    async fn delete_route(&self, id: &str) -> ProxyResult<()>;

    /// Subscribe to the change stream. Each subscriber gets its own bounded
    /// queue; slow subscribers lose events rather than blocking mutators.
    fn watch(&self) -> mpsc::Receiver<StorageEvent>;
}
