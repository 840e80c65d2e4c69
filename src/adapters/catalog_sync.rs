//! Applies catalog change events to the data plane.
//!
//! Events are hints, not deltas: route changes trigger a full reconcile
//! against `list_routes`, so a dropped event only delays convergence until
//! the next change. Service changes purge dependent state (server pools,
//! sticky sessions) and the pools rebuild lazily on the next request.

use std::sync::Arc;

use crate::{
    core::{balancer::LoadBalancer, pool::ServerPool, router::Router},
    ports::catalog::{CatalogObject, CatalogStore, ChangeKind},
    utils::graceful_shutdown::ShutdownToken,
};

pub struct CatalogSync {
    catalog: Arc<dyn CatalogStore>,
    router: Arc<Router>,
    pool: Arc<ServerPool>,
    /// The selection entry point: the sticky decorator when enabled,
    /// otherwise the bare strategy. `forget_server` fans through it.
    balancer: Arc<dyn LoadBalancer>,
}

impl CatalogSync {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        router: Arc<Router>,
        pool: Arc<ServerPool>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        Self {
            catalog,
            router,
            pool,
            balancer,
        }
    }

    /// Subscribe and apply events until shutdown or the catalog goes away.
    pub async fn run(self, mut shutdown: ShutdownToken) {
        let mut events = self.catalog.watch();
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.wait() => break,
            };

            self.apply(&event.object, event.change).await;
            tracing::debug!(id = %event.id, change = ?event.change, "applied catalog event");
        }
        tracing::info!("catalog sync stopped");
    }

    pub async fn apply(&self, object: &CatalogObject, change: ChangeKind) {
        match object {
            CatalogObject::Route(_) => match self.catalog.list_routes().await {
                Ok(routes) => self.router.set_routes(routes),
                Err(e) => tracing::error!(error = %e, "route reconcile failed"),
            },
            CatalogObject::Service(service) => {
                let removed = match change {
                    ChangeKind::Deleted => self.pool.remove_service(&service.id),
                    _ => self.pool.stale_servers(service),
                };
                for server_id in &removed {
                    self.balancer.forget_server(server_id);
                }
            }
        }
    }
}
