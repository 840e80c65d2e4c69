//! Request-to-route matching.
//!
//! A route matches when every predicate it specifies (host, path prefix,
//! path regex, header equalities) holds. Among matches the highest priority
//! wins; ties break to the longer path prefix, then to the lexicographically
//! smaller id so selection is deterministic.
//!
//! The router keeps a sorted index under a reader/writer lock and is rebuilt
//! wholesale from the catalog on change events; a linear scan over the
//! sorted index is fine at catalog scale.

use std::sync::RwLock;

use http::HeaderMap;

use crate::core::{
    error::{ProxyError, ProxyResult},
    model::Route,
    rewrite::RegexCache,
};

pub struct Router {
    routes: RwLock<Vec<Route>>,
    regex_cache: RegexCache,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            regex_cache: RegexCache::new(),
        }
    }

    /// Replace the whole route table (catalog reconcile path).
    pub fn set_routes(&self, mut routes: Vec<Route>) {
        sort_routes(&mut routes);
        *self.routes.write().unwrap_or_else(|e| e.into_inner()) = routes;
    }

    pub fn add_route(&self, route: Route) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|r| r.id != route.id);
        routes.push(route);
        sort_routes(&mut routes);
    }

    pub fn remove_route(&self, id: &str) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r.id != id);
    }

    pub fn list(&self) -> Vec<Route> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Find the winning route for a request, or `RouteNotFound`.
    ///
    /// Malformed routes (e.g. a regex that does not compile) are skipped,
    /// never fatal: the catalog may be mutated at runtime and one bad route
    /// must not take the data plane down.
    pub fn match_route(
        &self,
        host: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> ProxyResult<Route> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        // The index is kept in selection order, so the first match wins.
        routes
            .iter()
            .find(|route| self.route_matches(route, host, path, headers))
            .cloned()
            .ok_or(ProxyError::RouteNotFound)
    }

    fn route_matches(
        &self,
        route: &Route,
        host: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> bool {
        if let Some(pattern) = route.host.as_deref()
            && !pattern.is_empty()
            && !host_matches(pattern, host)
        {
            return false;
        }

        if let Some(prefix) = route.path_prefix.as_deref()
            && !prefix.is_empty()
            && !path.starts_with(prefix)
        {
            return false;
        }

        if let Some(pattern) = route.path_regex.as_deref()
            && !pattern.is_empty()
        {
            // Full-match semantics; anchor the pattern.
            let anchored = format!("^(?:{pattern})$");
            match self.regex_cache.get(&anchored) {
                Some(re) => {
                    if !re.is_match(path) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        for (name, expected) in &route.headers {
            let matches = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected);
            if !matches {
                return false;
            }
        }

        true
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| prefix_len(b).cmp(&prefix_len(a)))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn prefix_len(route: &Route) -> usize {
    route.path_prefix.as_deref().map_or(0, str::len)
}

/// Host predicate: case-insensitive after stripping the port; `*.suffix`
/// matches any host ending in `.suffix`.
fn host_matches(pattern: &str, host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    let host = strip_port(host).to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix('*') {
        // "*.example.com" keeps the leading dot, so "example.com" itself
        // does not match.
        host.ends_with(suffix)
    } else {
        host == pattern
    }
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets; only split a trailing :port.
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

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
    fn empty_host_matches_any() {
        let router = Router::new();
        router.set_routes(vec![route("r1", "s1")]);
        let m = router
            .match_route(Some("whatever.example.com"), "/x", &HeaderMap::new())
            .unwrap();
        assert_eq!(m.id, "r1");
    }

    #[test]
    fn host_match_is_case_insensitive_and_ignores_port() {
        let router = Router::new();
        let mut r = route("r1", "s1");
        r.host = Some("example.com".into());
        router.set_routes(vec![r]);

        assert!(
            router
                .match_route(Some("Example.COM:9090"), "/", &HeaderMap::new())
                .is_ok()
        );
        assert!(matches!(
            router.match_route(Some("other.com"), "/", &HeaderMap::new()),
            Err(ProxyError::RouteNotFound)
        ));
    }

    #[test]
    fn wildcard_host_requires_the_dot() {
        let router = Router::new();
        let mut r = route("r1", "s1");
        r.host = Some("*.example.com".into());
        router.set_routes(vec![r]);

        assert!(
            router
                .match_route(Some("api.example.com"), "/", &HeaderMap::new())
                .is_ok()
        );
        assert!(
            router
                .match_route(Some("a.b.example.com"), "/", &HeaderMap::new())
                .is_ok()
        );
        assert!(
            router
                .match_route(Some("example.com"), "/", &HeaderMap::new())
                .is_err()
        );
    }

    #[test]
    fn priority_wins_then_longer_prefix() {
        let router = Router::new();
        let mut low = route("r-low", "s1");
        low.path_prefix = Some("/api".into());
        low.priority = 50;
        let mut high = route("r-high", "s2");
        high.path_prefix = Some("/api/users".into());
        high.priority = 100;
        router.set_routes(vec![low.clone(), high]);

        let m = router
            .match_route(None, "/api/users/42", &HeaderMap::new())
            .unwrap();
        assert_eq!(m.id, "r-high");

        // Same priority: longer prefix wins.
        let mut long = route("r-long", "s3");
        long.path_prefix = Some("/api/users".into());
        long.priority = 50;
        router.set_routes(vec![low, long]);
        let m = router
            .match_route(None, "/api/users/42", &HeaderMap::new())
            .unwrap();
        assert_eq!(m.id, "r-long");
    }

    #[test]
    fn tie_breaks_are_deterministic_by_id() {
        let router = Router::new();
        router.set_routes(vec![route("r-b", "s1"), route("r-a", "s2")]);
        for _ in 0..5 {
            let m = router.match_route(None, "/", &HeaderMap::new()).unwrap();
            assert_eq!(m.id, "r-a");
        }
    }

    #[test]
    fn regex_must_fully_match() {
        let router = Router::new();
        let mut r = route("r1", "s1");
        r.path_regex = Some(r"/users/\d+".into());
        router.set_routes(vec![r]);

        assert!(
            router
                .match_route(None, "/users/42", &HeaderMap::new())
                .is_ok()
        );
        assert!(
            router
                .match_route(None, "/users/42/posts", &HeaderMap::new())
                .is_err()
        );
    }

    #[test]
    fn invalid_regex_skips_route_but_not_others() {
        let router = Router::new();
        let mut bad = route("r-bad", "s1");
        bad.path_regex = Some("(unclosed".into());
        bad.priority = 100;
        let good = route("r-good", "s2");
        router.set_routes(vec![bad, good]);

        let m = router.match_route(None, "/x", &HeaderMap::new()).unwrap();
        assert_eq!(m.id, "r-good");
    }

    #[test]
    fn header_predicates_all_must_match() {
        let router = Router::new();
        let mut r = route("r1", "s1");
        r.headers.insert("x-tenant".into(), "acme".into());
        r.headers.insert("x-stage".into(), "prod".into());
        router.set_routes(vec![r]);

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        assert!(router.match_route(None, "/", &headers).is_err());

        headers.insert("x-stage", "prod".parse().unwrap());
        assert!(router.match_route(None, "/", &headers).is_ok());
    }

    #[test]
    fn add_and_remove_rebuild_the_index() {
        let router = Router::new();
        router.add_route(route("r1", "s1"));
        assert_eq!(router.list().len(), 1);
        router.add_route(route("r1", "s2"));
        assert_eq!(router.list().len(), 1);
        assert_eq!(router.list()[0].service_id, "s2");
        router.remove_route("r1");
        assert!(router.match_route(None, "/", &HeaderMap::new()).is_err());
    }
}
