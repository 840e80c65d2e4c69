// Routing scenarios: host matching, wildcard + priority, determinism.
use std::collections::HashMap;

use http::HeaderMap;
use switchyard::core::{ProxyError, Router, model::Route};

fn route(id: &str, service: &str) -> Route {
    Route {
        id: id.to_string(),
        priority: 0,
        host: None,
        path_prefix: None,
        path_regex: None,
        headers: HashMap::new(),
        service_id: service.to_string(),
        middlewares: Vec::new(),
        rewrite_rules: Vec::new(),
        preserve_host: false,
    }
}

#[test]
fn host_exact_match_ignores_request_port() {
    let router = Router::new();
    let mut r = route("r1", "s1");
    r.host = Some("example.com".into());
    router.set_routes(vec![r]);

    // Inbound Host carries the listener port; matching strips it.
    let matched = router
        .match_route(Some("example.com:9090"), "/x", &HeaderMap::new())
        .expect("host should match");
    assert_eq!(matched.service_id, "s1");

    assert!(matches!(
        router.match_route(Some("not-example.com"), "/x", &HeaderMap::new()),
        Err(ProxyError::RouteNotFound)
    ));
}

#[test]
fn wildcard_and_priority_select_the_most_specific_route() {
    let router = Router::new();

    let mut api = route("r-api", "s1");
    api.path_prefix = Some("/api".into());
    api.priority = 50;

    let mut users = route("r-users", "s2");
    users.path_prefix = Some("/api/users".into());
    users.priority = 100;

    let mut wildcard = route("r-wild", "s3");
    wildcard.host = Some("*.example.com".into());
    wildcard.priority = 10;

    router.set_routes(vec![api, users, wildcard]);

    // Scenario: /api/users/42 matches the higher-priority narrower route.
    let matched = router
        .match_route(Some("example.com"), "/api/users/42", &HeaderMap::new())
        .unwrap();
    assert_eq!(matched.id, "r-users");

    // Lower priority still catches the broader prefix.
    let matched = router
        .match_route(Some("example.com"), "/api/orders", &HeaderMap::new())
        .unwrap();
    assert_eq!(matched.id, "r-api");

    // The wildcard route only sees subdomains.
    let matched = router
        .match_route(Some("api.example.com"), "/other", &HeaderMap::new())
        .unwrap();
    assert_eq!(matched.id, "r-wild");
    assert!(
        router
            .match_route(Some("example.com"), "/other", &HeaderMap::new())
            .is_err()
    );
}

#[test]
fn matching_is_a_pure_function_of_the_request() {
    let router = Router::new();
    let mut a = route("r-a", "s1");
    a.path_prefix = Some("/svc".into());
    let mut b = route("r-b", "s2");
    b.path_prefix = Some("/svc".into());
    router.set_routes(vec![b, a]);

    let mut headers = HeaderMap::new();
    headers.insert("x-variant", "blue".parse().unwrap());

    let first = router
        .match_route(Some("example.com"), "/svc/x", &headers)
        .unwrap();
    for _ in 0..50 {
        let again = router
            .match_route(Some("example.com"), "/svc/x", &headers)
            .unwrap();
        assert_eq!(again.id, first.id);
    }
}

#[test]
fn header_predicates_route_by_tenant() {
    let router = Router::new();
    let mut blue = route("r-blue", "s-blue");
    blue.headers.insert("x-tenant".into(), "blue".into());
    blue.priority = 10;
    let fallback = route("r-any", "s-any");
    router.set_routes(vec![blue, fallback]);

    let mut headers = HeaderMap::new();
    headers.insert("x-tenant", "blue".parse().unwrap());
    assert_eq!(
        router.match_route(None, "/", &headers).unwrap().id,
        "r-blue"
    );

    headers.insert("x-tenant", "green".parse().unwrap());
    assert_eq!(router.match_route(None, "/", &headers).unwrap().id, "r-any");
}
