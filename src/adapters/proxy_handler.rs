//! The request-handling data plane.
//!
//! Per request: rate-limit preflight, route match, service lookup, server
//! selection (optionally sticky), connection accounting, path rewriting,
//! outbound request building, circuit-breaker gating, the transport
//! round-trip with per-service timeout, passive health recording, and error
//! → status mapping at the edge. Introspection endpoints (`/health`,
//! `/prometheus/metrics`) are answered before routing.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, header, request::Parts};
use http_body_util::BodyExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::models::RetryConfig,
    core::{
        balancer::{LoadBalancer, SelectContext, StickySessions, sticky::StickyAssignment},
        breaker::MultiCircuitBreaker,
        director,
        error::{ProxyError, ProxyResult},
        health::HealthRegistry,
        model::{Server, Service},
        pool::ServerPool,
        rate_limit::ClientRateLimiter,
        rewrite::{self, UrlRewriter},
        router::Router,
    },
    ports::{catalog::CatalogStore, http_client::HttpClient},
    tracing_setup,
    utils::{BufferPool, ConnectionTracker, remote_ip},
};

const SERVER_HEADER: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

pub struct ProxyHandler {
    catalog: Arc<dyn CatalogStore>,
    router: Arc<Router>,
    pool: Arc<ServerPool>,
    balancer: Arc<dyn LoadBalancer>,
    sticky: Option<Arc<StickySessions>>,
    registry: Arc<HealthRegistry>,
    breakers: Option<Arc<MultiCircuitBreaker>>,
    limiter: Option<Arc<ClientRateLimiter>>,
    client: Arc<dyn HttpClient>,
    rewriter: UrlRewriter,
    buffers: Arc<BufferPool>,
    tracker: Arc<ConnectionTracker>,
    retry: RetryConfig,
    inbound_tls: bool,
    started_at: Instant,
}

impl ProxyHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        router: Arc<Router>,
        pool: Arc<ServerPool>,
        balancer: Arc<dyn LoadBalancer>,
        sticky: Option<Arc<StickySessions>>,
        registry: Arc<HealthRegistry>,
        breakers: Option<Arc<MultiCircuitBreaker>>,
        limiter: Option<Arc<ClientRateLimiter>>,
        client: Arc<dyn HttpClient>,
        tracker: Arc<ConnectionTracker>,
        retry: RetryConfig,
        inbound_tls: bool,
    ) -> Self {
        Self {
            catalog,
            router,
            pool,
            balancer,
            sticky,
            registry,
            breakers,
            limiter,
            client,
            rewriter: UrlRewriter::new(),
            buffers: Arc::new(BufferPool::new()),
            tracker,
            retry,
            inbound_tls,
            started_at: Instant::now(),
        }
    }

    /// Entry point for the inbound server. Never fails: every error becomes
    /// a mapped status with a short plain-text body.
    pub async fn handle(&self, req: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/health" => return self.handle_health().await,
            "/prometheus/metrics" => return self.handle_metrics(),
            _ => {}
        }

        let started = Instant::now();
        let method = req.method().clone();
        let _in_flight = self.tracker.begin_request();

        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let client_ip = remote_ip::client_ip(req.headers(), peer).map(|ip| ip.to_string());
        let span = tracing_setup::create_request_span(
            method.as_str(),
            &path,
            &request_id,
            client_ip.as_deref(),
        );

        let result = self.dispatch_request(req, peer).instrument(span.clone()).await;
        let duration = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => self.error_response(&e),
        };

        let status = response.status();
        span.record("http.status_code", status.as_u16());
        span.record("duration_ms", duration.as_millis() as u64);
        span.in_scope(|| {
            if status.is_server_error() {
                tracing::warn!(status = status.as_u16(), duration_ms = duration.as_millis() as u64, "request completed");
            } else {
                tracing::info!(status = status.as_u16(), duration_ms = duration.as_millis() as u64, "request completed");
            }
        });
        crate::metrics::increment_request_total(&path, method.as_str(), status.as_u16());
        crate::metrics::record_request_duration(&path, method.as_str(), duration);

        response
    }

    async fn dispatch_request(
        &self,
        req: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> ProxyResult<Response<Body>> {
        if let Some(limiter) = &self.limiter {
            let key = limiter.key_for(req.headers(), peer);
            if !limiter.allow(&key) {
                crate::metrics::increment_rate_limited();
                return Err(ProxyError::RateLimitExceeded(key));
            }
        }

        let path = req.uri().path().to_string();
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let route = self
            .router
            .match_route(host.as_deref(), &path, req.headers())?;
        tracing::Span::current().record("route.id", route.id.as_str());

        let service = self.catalog.get_service(&route.service_id).await?;
        if !service.active {
            tracing::info!(service = %service.id, "service is inactive");
            return Err(ProxyError::NoHealthyBackends);
        }

        let servers = self.pool.servers_for(&service);
        if servers.is_empty() {
            return Err(ProxyError::NoHealthyBackends);
        }

        let client_ip = remote_ip::client_ip(req.headers(), peer);
        let ctx = SelectContext::new(client_ip, req.headers());
        let (server, assignment) = match &self.sticky {
            Some(sticky) => {
                let outcome = sticky.select_with_session(&ctx, &servers)?;
                (outcome.server, outcome.assignment)
            }
            None => (self.balancer.select(&ctx, &servers)?, None),
        };
        tracing::Span::current().record("backend.url", server.url.as_str());

        // Connection slot; the guard releases it on every exit path,
        // cancellation included.
        let _conn = server.acquire();

        let mut out_path = self.rewriter.apply(&path, &route.rewrite_rules);
        if service.strip_prefix
            && let Some(prefix) = route.path_prefix.as_deref()
            && !prefix.is_empty()
        {
            out_path = rewrite::strip_prefix(&out_path, prefix);
        }

        let mut req = req;
        director::direct(
            &mut req,
            &server,
            &out_path,
            route.preserve_host,
            peer,
            self.inbound_tls,
            &server.metadata,
        )?;

        let breaker = self
            .breakers
            .as_ref()
            .map(|breakers| breakers.breaker_for(&service.id));
        let passage = match breaker.as_deref() {
            Some(breaker) => Some(breaker.try_acquire()?),
            None => None,
        };

        let outcome = self.dispatch(req, &service).await;

        self.record_health(&server, &outcome);
        if let Some(passage) = passage {
            match &outcome {
                Ok(response) if !response.status().is_server_error() => passage.success(),
                _ => passage.failure(),
            }
        }

        let mut response = outcome?;
        if let Some(assignment) = assignment
            && (response.status().is_success() || response.status().is_redirection())
        {
            self.set_session_cookie(&mut response, &assignment);
        }
        Ok(response)
    }

    /// Transport round-trip with the per-service deadline; retries only when
    /// enabled, the method is idempotent, the body fit the buffer limit, and
    /// the failure kind is retryable.
    async fn dispatch(
        &self,
        req: Request<Body>,
        service: &Service,
    ) -> ProxyResult<Response<Body>> {
        let deadline = service.timeout();
        let backend = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();

        let retryable =
            self.retry.enabled && is_idempotent(req.method()) && self.body_is_bufferable(&req);
        if !retryable {
            return self.dispatch_once(req, deadline, &backend).await;
        }

        let (parts, body) = req.into_parts();
        let buffered = self.collect_body(body).await?;

        let mut attempt = 1u32;
        loop {
            let req = rebuild_request(&parts, Body::from(buffered.clone()))?;
            let result = self.dispatch_once(req, deadline, &backend).await;
            match result {
                Err(ref e)
                    if e.is_retryable() && attempt < self.retry.max_attempts =>
                {
                    let backoff = self.retry.backoff(attempt);
                    tracing::info!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying upstream dispatch"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn dispatch_once(
        &self,
        req: Request<Body>,
        deadline: Duration,
        backend: &str,
    ) -> ProxyResult<Response<Body>> {
        let started = Instant::now();
        let result = tokio::time::timeout(deadline, self.client.forward(req))
            .await
            .map_err(|_| ProxyError::Timeout(deadline))
            .and_then(|inner| inner);

        let duration = started.elapsed();
        crate::metrics::record_backend_request_duration(backend, duration);
        if let Ok(response) = &result {
            crate::metrics::increment_backend_request_total(backend, response.status().as_u16());
        }
        result
    }

    /// Whether the request body can be buffered for replay: a declared
    /// length within `retry.buffer_limit`, or no declared length on a
    /// method that conventionally carries no body. Anything else streams
    /// through once, unretried.
    fn body_is_bufferable(&self, req: &Request<Body>) -> bool {
        match req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            Some(length) => length <= self.retry.buffer_limit,
            None => matches!(
                *req.method(),
                http::Method::GET | http::Method::HEAD | http::Method::OPTIONS | http::Method::TRACE
            ),
        }
    }

    /// Collect the request body through the shared buffer pool. Bodies that
    /// overrun `retry.buffer_limit` mid-stream (a lying Content-Length) are
    /// rejected.
    async fn collect_body(&self, body: Body) -> ProxyResult<Bytes> {
        let mut scratch = self.buffers.get();
        let mut stream = body;
        while let Some(frame) = stream.frame().await.transpose().map_err(|e| {
            ProxyError::InvalidRequest(format!("failed reading request body: {e}"))
        })? {
            if let Some(chunk) = frame.data_ref() {
                if scratch.len() + chunk.len() > self.retry.buffer_limit {
                    self.buffers.put(scratch);
                    return Err(ProxyError::InvalidRequest(
                        "request body exceeds the retry buffer limit".into(),
                    ));
                }
                scratch.extend_from_slice(chunk);
            }
        }
        let bytes = Bytes::copy_from_slice(&scratch);
        self.buffers.put(scratch);
        Ok(bytes)
    }

    /// 2xx/3xx count as passive successes, 5xx and transport errors as
    /// failures; 4xx and cancellations record nothing.
    fn record_health(&self, server: &Server, outcome: &ProxyResult<Response<Body>>) {
        match outcome {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    self.registry.record_success(&server.id);
                } else if status.is_server_error() {
                    self.registry
                        .record_failure(&server.id, &format!("upstream status {status}"));
                }
            }
            Err(
                e @ (ProxyError::Timeout(_)
                | ProxyError::ConnectionRefused(_)
                | ProxyError::Upstream(_)),
            ) => {
                self.registry.record_failure(&server.id, &e.to_string());
            }
            Err(_) => {}
        }
    }

    fn set_session_cookie(&self, response: &mut Response<Body>, assignment: &StickyAssignment) {
        let cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly",
            assignment.cookie_name,
            assignment.session_id,
            assignment.ttl.as_secs()
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    fn error_response(&self, error: &ProxyError) -> Response<Body> {
        let status = error.status_code();
        let mut builder = Response::builder()
            .status(status)
            .header(header::SERVER, SERVER_HEADER)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");

        if let ProxyError::RateLimitExceeded(key) = error {
            builder = builder.header(header::RETRY_AFTER, "1");
            if let Some(limiter) = &self.limiter {
                builder = builder
                    .header("x-ratelimit-limit", limiter.limit(key).to_string())
                    .header("x-ratelimit-remaining", "0");
            }
        }

        builder
            .body(Body::from(error.to_string()))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(Body::from("internal error"));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }

    /// `GET /health`: runtime introspection JSON.
    async fn handle_health(&self) -> Response<Body> {
        let snapshot = self.registry.snapshot();
        let healthy = snapshot.iter().filter(|s| s.healthy).count();
        let body = serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "worker_threads": worker_threads(),
            "memory_bytes": resident_memory_bytes(),
            "requests": {
                "active": self.tracker.active(),
                "total": self.tracker.total(),
            },
            "backends": {
                "healthy": healthy,
                "tracked": snapshot.len(),
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::SERVER, SERVER_HEADER)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    /// `GET /prometheus/metrics`: text exposition of the metric families.
    fn handle_metrics(&self) -> Response<Body> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::SERVER, SERVER_HEADER)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(crate::metrics::render_prometheus()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

fn is_idempotent(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::OPTIONS
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::TRACE
    )
}

fn rebuild_request(parts: &Parts, body: Body) -> ProxyResult<Request<Body>> {
    let built = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .version(parts.version)
        .body(())
        .map_err(|e| ProxyError::InvalidRequest(format!("rebuilding request: {e}")))?;
    let (mut cloned, ()) = built.into_parts();
    cloned.headers = parts.headers.clone();
    Ok(Request::from_parts(cloned, body))
}

fn worker_threads() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_workers())
        .unwrap_or(0)
}

/// Resident set size from procfs; 0 where unavailable.
fn resident_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm")
            && let Some(resident_pages) = statm.split_whitespace().nth(1)
            && let Ok(pages) = resident_pages.parse::<u64>()
        {
            return pages * 4096;
        }
    }
    0
}
