// Catalog → data-plane convergence: changes land on the router within a
// bounded delay, deletes purge dependent state.
use std::{sync::Arc, time::Duration};

use http::HeaderMap;
use switchyard::{
    adapters::{CatalogSync, MemoryCatalog},
    core::{
        HealthRegistry, Router, ServerPool,
        balancer::{LoadBalancer, RoundRobin, SelectContext, StickySessions},
        model::{Route, Service},
    },
    ports::catalog::CatalogStore,
    utils::GracefulShutdown,
};

fn service(id: &str) -> Service {
    Service {
        id: id.into(),
        name: id.into(),
        endpoints: vec!["http://10.0.0.1:8080".into()],
        health_path: "/health".into(),
        weight: 1,
        max_conns_per_endpoint: 0,
        timeout_secs: 30,
        metadata: Default::default(),
        tls: None,
        strip_prefix: false,
        active: true,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn route(id: &str, service_id: &str, prefix: &str) -> Route {
    Route {
        id: id.into(),
        priority: 0,
        host: None,
        path_prefix: Some(prefix.into()),
        path_regex: None,
        headers: Default::default(),
        service_id: service_id.into(),
        middlewares: Vec::new(),
        rewrite_rules: Vec::new(),
        preserve_host: false,
    }
}

async fn await_convergence<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("catalog change did not converge within one second");
}

#[tokio::test(flavor = "multi_thread")]
async fn route_changes_converge_onto_the_router() {
    let catalog = Arc::new(MemoryCatalog::new());
    let store: Arc<dyn CatalogStore> = catalog.clone();
    let router = Arc::new(Router::new());
    let registry = Arc::new(HealthRegistry::default());
    let pool = Arc::new(ServerPool::new(registry.clone()));
    let balancer: Arc<dyn LoadBalancer> = Arc::new(RoundRobin::new());

    let shutdown = GracefulShutdown::new(Duration::from_secs(5));
    let sync = CatalogSync::new(store.clone(), router.clone(), pool, balancer);
    let task = tokio::spawn(sync.run(shutdown.token()));

    catalog.create_service(service("s1")).await.unwrap();
    catalog
        .create_route(route("r1", "s1", "/api"))
        .await
        .unwrap();

    let probe_router = router.clone();
    await_convergence(move || {
        probe_router
            .match_route(None, "/api/x", &HeaderMap::new())
            .is_ok()
    })
    .await;

    // Deleting the route converges too.
    catalog.delete_route("r1").await.unwrap();
    let probe_router = router.clone();
    await_convergence(move || {
        probe_router
            .match_route(None, "/api/x", &HeaderMap::new())
            .is_err()
    })
    .await;

    shutdown.trigger();
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn service_delete_purges_pools_and_sessions() {
    let catalog = Arc::new(MemoryCatalog::new());
    let store: Arc<dyn CatalogStore> = catalog.clone();
    let router = Arc::new(Router::new());
    let registry = Arc::new(HealthRegistry::default());
    let pool = Arc::new(ServerPool::new(registry.clone()));
    let sticky = Arc::new(StickySessions::new(
        Arc::new(RoundRobin::new()),
        "lb_session",
        Duration::from_secs(1800),
    ));
    let entry: Arc<dyn LoadBalancer> = sticky.clone();

    catalog.create_service(service("s1")).await.unwrap();
    let svc = catalog.get_service("s1").await.unwrap();
    let servers = pool.servers_for(&svc);
    assert_eq!(servers.len(), 1);

    // Pin a session to the only server.
    let empty = HeaderMap::new();
    let ctx = SelectContext::new(None, &empty);
    sticky.select_with_session(&ctx, &servers).unwrap();
    assert_eq!(sticky.session_count(), 1);

    let shutdown = GracefulShutdown::new(Duration::from_secs(5));
    let sync = CatalogSync::new(store.clone(), router.clone(), pool.clone(), entry);
    let task = tokio::spawn(sync.run(shutdown.token()));

    catalog.delete_service("s1").await.unwrap();

    let probe_pool = pool.clone();
    let probe_sticky = sticky.clone();
    await_convergence(move || {
        probe_pool.tracked_services() == 0 && probe_sticky.session_count() == 0
    })
    .await;

    shutdown.trigger();
    let _ = task.await;
}
