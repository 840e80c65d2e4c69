//! Outbound request preparation.
//!
//! Rewrites a matched inbound request so it can be dispatched to the chosen
//! backend server: swap scheme/authority, honor the Host policy, stamp the
//! `X-Forwarded-*` family and `X-Request-ID`, strip hop-by-hop headers per
//! RFC 7230, and apply backend metadata headers.

use std::{collections::HashMap, net::SocketAddr};

use http::{HeaderName, HeaderValue, Request, Uri, header};
use uuid::Uuid;

use crate::core::{
    error::{ProxyError, ProxyResult},
    model::Server,
};

/// Headers that are connection-scoped and must never be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Metadata keys of this form become forwarded request headers.
const HEADER_METADATA_PREFIX: &str = "header:";

/// Rewrite `req` in place for dispatch to `server`.
///
/// `path` is the already-rewritten request path; the original query string
/// is preserved. `inbound_tls` reflects the listener the request arrived on
/// and drives `X-Forwarded-Proto` / the default forwarded port.
pub fn direct<B>(
    req: &mut Request<B>,
    server: &Server,
    path: &str,
    preserve_host: bool,
    peer: Option<SocketAddr>,
    inbound_tls: bool,
    metadata: &HashMap<String, String>,
) -> ProxyResult<()> {
    let original_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    let original_query = req.uri().query().map(String::from);
    let real_ip = crate::utils::remote_ip::client_ip(req.headers(), peer);

    // Target URI: scheme and authority from the server, rewritten path plus
    // the original query.
    let scheme = server.url.scheme();
    let host = server
        .url
        .host_str()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("backend URL has no host: {}", server.url)))?;
    let authority = match server.url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path_and_query = match &original_query {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let uri: Uri = format!("{scheme}://{authority}{path_and_query}")
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("backend URI: {e}")))?;
    *req.uri_mut() = uri;

    strip_hop_by_hop(req.headers_mut());

    let headers = req.headers_mut();

    // Host policy: keep the client's Host or present the backend's.
    let host_value = if preserve_host {
        original_host.clone()
    } else {
        Some(authority.clone())
    };
    if let Some(value) = host_value.as_deref().and_then(parse_value) {
        headers.insert(header::HOST, value);
    }

    if let Some(addr) = peer {
        let hop = addr.ip().to_string();
        let chain = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) if !existing.is_empty() => format!("{existing}, {hop}"),
            _ => hop,
        };
        if let Some(value) = parse_value(&chain) {
            headers.insert("x-forwarded-for", value);
        }
    }
    if let Some(ip) = real_ip
        && let Some(value) = parse_value(&ip.to_string())
    {
        headers.insert("x-real-ip", value);
    }

    let proto = if inbound_tls { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));

    if let Some(original_host) = original_host.as_deref() {
        if let Some(value) = parse_value(original_host) {
            headers.insert("x-forwarded-host", value);
        }
        let port = host_port(original_host)
            .unwrap_or(if inbound_tls { 443 } else { 80 });
        if let Some(value) = parse_value(&port.to_string()) {
            headers.insert("x-forwarded-port", value);
        }
    }

    if !headers.contains_key("x-request-id")
        && let Some(value) = parse_value(&Uuid::new_v4().to_string())
    {
        headers.insert("x-request-id", value);
    }

    for (key, value) in metadata {
        if let Some(name) = key.strip_prefix(HEADER_METADATA_PREFIX)
            && let Ok(name) = name.parse::<HeaderName>()
            && let Some(value) = parse_value(value)
        {
            headers.insert(name, value);
        }
    }

    Ok(())
}

/// Remove RFC 7230 hop-by-hop headers plus anything the inbound
/// `Connection` header nominated.
fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in nominated {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn parse_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

fn host_port(host: &str) -> Option<u16> {
    if host.ends_with(']') {
        return None;
    }
    host.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use http::Method;

    use super::*;
    use crate::core::{health::HealthRegistry, model::Service};

    fn backend(endpoint: &str, metadata: &[(&str, &str)]) -> Arc<Server> {
        let service = Service {
            id: "s1".into(),
            name: "s1".into(),
            endpoints: vec![endpoint.to_string()],
            health_path: "/health".into(),
            weight: 1,
            max_conns_per_endpoint: 0,
            timeout_secs: 30,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tls: None,
            strip_prefix: false,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        Server::materialize(&service, &HealthRegistry::default())
            .pop()
            .unwrap()
    }

    fn inbound(path: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri(format!("http://example.com:9090{path}"))
            .header(header::HOST, "example.com:9090")
            .body(())
            .unwrap()
    }

    fn peer() -> Option<SocketAddr> {
        Some("198.51.100.4:40000".parse().unwrap())
    }

    #[test]
    fn rewrites_scheme_host_and_path() {
        let server = backend("http://10.0.0.1:8080", &[]);
        let mut req = inbound("/x?q=1");
        direct(&mut req, &server, "/x", false, peer(), false, &server.metadata).unwrap();

        assert_eq!(req.uri().to_string(), "http://10.0.0.1:8080/x?q=1");
        assert_eq!(req.headers()[header::HOST], "10.0.0.1:8080");
        assert_eq!(req.headers()["x-forwarded-host"], "example.com:9090");
        assert_eq!(req.headers()["x-forwarded-port"], "9090");
        assert_eq!(req.headers()["x-forwarded-proto"], "http");
    }

    #[test]
    fn preserve_host_keeps_the_original() {
        let server = backend("http://10.0.0.1:8080", &[]);
        let mut req = inbound("/x");
        direct(&mut req, &server, "/x", true, peer(), false, &server.metadata).unwrap();
        assert_eq!(req.headers()[header::HOST], "example.com:9090");
    }

    #[test]
    fn appends_to_existing_forwarded_chain() {
        let server = backend("http://10.0.0.1:8080", &[]);
        let mut req = inbound("/x");
        req.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7"),
        );
        direct(&mut req, &server, "/x", false, peer(), false, &server.metadata).unwrap();

        assert_eq!(
            req.headers()["x-forwarded-for"],
            "203.0.113.7, 198.51.100.4"
        );
        // First hop wins for X-Real-IP.
        assert_eq!(req.headers()["x-real-ip"], "203.0.113.7");
    }

    #[test]
    fn generates_request_id_only_when_absent() {
        let server = backend("http://10.0.0.1:8080", &[]);
        let mut req = inbound("/x");
        req.headers_mut()
            .insert("x-request-id", HeaderValue::from_static("keep-me"));
        direct(&mut req, &server, "/x", false, peer(), false, &server.metadata).unwrap();
        assert_eq!(req.headers()["x-request-id"], "keep-me");

        let mut req = inbound("/x");
        direct(&mut req, &server, "/x", false, peer(), false, &server.metadata).unwrap();
        assert!(!req.headers()["x-request-id"].is_empty());
    }

    #[test]
    fn strips_hop_by_hop_and_connection_nominated() {
        let server = backend("http://10.0.0.1:8080", &[]);
        let mut req = inbound("/x");
        let headers = req.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-drop-me"));
        headers.insert("x-drop-me", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert("x-keep-me", HeaderValue::from_static("1"));

        direct(&mut req, &server, "/x", false, peer(), false, &server.metadata).unwrap();

        let headers = req.headers();
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key("x-drop-me"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key(header::TE));
        assert!(headers.contains_key("x-keep-me"));
    }

    #[test]
    fn https_listener_sets_proto_and_default_port() {
        let server = backend("http://10.0.0.1:8080", &[]);
        let mut req = Request::builder()
            .uri("https://example.com/x")
            .header(header::HOST, "example.com")
            .body(())
            .unwrap();
        direct(&mut req, &server, "/x", false, peer(), true, &server.metadata).unwrap();
        assert_eq!(req.headers()["x-forwarded-proto"], "https");
        assert_eq!(req.headers()["x-forwarded-port"], "443");
    }

    #[test]
    fn metadata_headers_are_applied() {
        let server = backend(
            "http://10.0.0.1:8080",
            &[("header:X-Tenant", "acme"), ("region", "eu-west")],
        );
        let mut req = inbound("/x");
        direct(&mut req, &server, "/x", false, peer(), false, &server.metadata).unwrap();
        assert_eq!(req.headers()["x-tenant"], "acme");
        assert!(!req.headers().contains_key("region"));
    }
}
